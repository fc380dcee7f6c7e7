//! File-backed keg ledger.
//!
//! Layout under the ledger directory:
//! - `kegs.json`: the keg book (atomically replaced on every change)
//! - `pours.jsonl`: pour history, one event per line
//! - `ledger.lock`: held exclusively across every read-modify-write, so
//!   flow-meter reports and manual pours from other processes serialise

use crate::delivery::PourLedger;
use crate::journal::Journal;
use crate::store::{load_json, save_json};
use crate::{
    Error, Keg, KegStatus, NewKeg, PourEvent, PourReceipt, PourReport, PourSource, Result, TapId,
};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Persistent list of kegs
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KegBook {
    #[serde(default)]
    next_id: u32,
    #[serde(default)]
    kegs: Vec<Keg>,
    /// Most recently booked pour ids, oldest first
    #[serde(default)]
    applied: VecDeque<Uuid>,
}

/// How many booked pour ids the keg book remembers
const APPLIED_POURS_KEPT: usize = 256;

impl KegBook {
    pub fn kegs(&self) -> &[Keg] {
        &self.kegs
    }

    fn get_mut(&mut self, id: u32) -> Result<&mut Keg> {
        self.kegs
            .iter_mut()
            .find(|k| k.id == id)
            .ok_or_else(|| Error::Ledger(format!("keg {} not found", id)))
    }

    fn remember(&mut self, pour_id: Uuid) {
        self.applied.push_back(pour_id);
        while self.applied.len() > APPLIED_POURS_KEPT {
            self.applied.pop_front();
        }
    }

    fn tapped_at(&self, tap: TapId) -> Option<&Keg> {
        self.kegs
            .iter()
            .find(|k| k.status == KegStatus::Tapped && k.tap_position == Some(tap))
    }
}

/// Ledger stored in a directory
#[derive(Clone, Debug)]
pub struct FileLedger {
    dir: PathBuf,
    history: Journal,
}

impl FileLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let history = Journal::new(dir.join("pours.jsonl"));
        Self { dir, history }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn book_path(&self) -> PathBuf {
        self.dir.join("kegs.json")
    }

    /// Run `f` while holding the ledger lock
    fn with_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        std::fs::create_dir_all(&self.dir)?;
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join("ledger.lock"))?;
        lock.lock_exclusive()?;
        let result = f();
        lock.unlock()?;
        result
    }

    fn load_book(&self) -> Result<KegBook> {
        Ok(load_json(&self.book_path())?.unwrap_or_default())
    }

    fn update_book<T>(&self, f: impl FnOnce(&mut KegBook) -> Result<T>) -> Result<T> {
        self.with_lock(|| {
            let mut book = self.load_book()?;
            let out = f(&mut book)?;
            save_json(&self.book_path(), &book)?;
            Ok(out)
        })
    }

    /// All kegs, oldest first
    pub fn kegs(&self) -> Result<Vec<Keg>> {
        Ok(self.load_book()?.kegs)
    }

    pub fn keg(&self, id: u32) -> Result<Option<Keg>> {
        Ok(self.load_book()?.kegs.into_iter().find(|k| k.id == id))
    }

    /// The keg currently tapped at `tap`
    pub fn keg_on_tap(&self, tap: TapId) -> Result<Option<Keg>> {
        Ok(self.load_book()?.tapped_at(tap).cloned())
    }

    pub fn add_keg(&self, new: NewKeg) -> Result<Keg> {
        if new.name.trim().is_empty() {
            return Err(Error::Ledger("keg name must not be empty".into()));
        }
        if !(new.volume.is_finite() && new.volume > 0.0) {
            return Err(Error::Ledger(format!(
                "keg volume must be positive, got {}",
                new.volume
            )));
        }
        let keg = self.update_book(|book| {
            book.next_id = book.next_id.max(book.kegs.iter().map(|k| k.id).max().unwrap_or(0));
            book.next_id += 1;
            let keg = Keg {
                id: book.next_id,
                name: new.name,
                style: new.style,
                abv: new.abv,
                volume_remaining: new.volume,
                original_volume: new.volume,
                status: KegStatus::Untapped,
                tap_position: None,
                date_created: Utc::now(),
                date_last_tapped: None,
                date_finished: None,
            };
            book.kegs.push(keg.clone());
            Ok(keg)
        })?;
        tracing::info!("Added keg {} ({})", keg.id, keg.name);
        Ok(keg)
    }

    /// Put an untapped or previously tapped keg on `tap`
    pub fn tap_keg(&self, id: u32, tap: TapId) -> Result<Keg> {
        let keg = self.update_book(|book| {
            if let Some(other) = book.tapped_at(tap) {
                if other.id != id {
                    return Err(Error::Ledger(format!(
                        "tap {} already serves keg {} ({})",
                        tap, other.id, other.name
                    )));
                }
            }
            let keg = book.get_mut(id)?;
            if keg.status == KegStatus::Tapped {
                return Err(Error::Ledger(format!("keg {} is already tapped", id)));
            }
            keg.status = KegStatus::Tapped;
            keg.tap_position = Some(tap);
            keg.date_last_tapped = Some(Utc::now());
            Ok(keg.clone())
        })?;
        tracing::info!("Tapped keg {} on tap {}", keg.id, tap);
        Ok(keg)
    }

    pub fn take_off_tap(&self, id: u32) -> Result<Keg> {
        let keg = self.update_book(|book| {
            let keg = book.get_mut(id)?;
            if keg.status != KegStatus::Tapped {
                return Err(Error::Ledger(format!("keg {} is not tapped", id)));
            }
            keg.status = KegStatus::OffTap;
            keg.tap_position = None;
            keg.date_finished = Some(Utc::now());
            Ok(keg.clone())
        })?;
        tracing::info!("Took keg {} off tap", keg.id);
        Ok(keg)
    }

    /// Book one pour under the ledger lock.
    ///
    /// The history event is appended before the keg book is saved, and both
    /// steps are keyed on `pour_id`. A retry after a partial failure finishes
    /// the missing step without booking the pour twice.
    fn apply_pour(
        &self,
        pour_id: Uuid,
        select: impl FnOnce(&KegBook) -> Result<u32>,
        tap: Option<TapId>,
        volume: f64,
        poured_at: DateTime<Utc>,
        source: PourSource,
    ) -> Result<PourReceipt> {
        if !(volume.is_finite() && volume >= 0.0) {
            return Err(Error::Ledger(format!(
                "pour volume must be non-negative, got {}",
                volume
            )));
        }
        self.with_lock(|| {
            let mut book = self.load_book()?;
            let id = select(&book)?;

            if book.applied.contains(&pour_id) {
                let keg = book.get_mut(id)?;
                tracing::debug!("Pour {} already booked against keg {}", pour_id, keg.id);
                return Ok(PourReceipt {
                    keg_id: keg.id,
                    volume_remaining: keg.volume_remaining,
                });
            }

            let keg = book.get_mut(id)?;
            if keg.status != KegStatus::Tapped {
                return Err(Error::Ledger(format!("keg {} is not tapped", id)));
            }
            keg.volume_remaining = (keg.volume_remaining - volume).max(0.0);
            let receipt = PourReceipt {
                keg_id: keg.id,
                volume_remaining: keg.volume_remaining,
            };
            let low = keg.is_low().then(|| keg.name.clone());

            if !self.history_contains(pour_id)? {
                self.history.append(&PourEvent {
                    id: pour_id,
                    keg_id: receipt.keg_id,
                    tap,
                    volume,
                    poured_at,
                    source,
                })?;
            }
            book.remember(pour_id);
            save_json(&self.book_path(), &book)?;

            if let Some(name) = low {
                tracing::warn!(
                    "Keg {} ({}) is low: {:.2}L left",
                    receipt.keg_id,
                    name,
                    receipt.volume_remaining
                );
            }
            Ok(receipt)
        })
    }

    fn history_contains(&self, pour_id: Uuid) -> Result<bool> {
        let events: Vec<PourEvent> = self.history.read_all()?;
        Ok(events.iter().any(|e| e.id == pour_id))
    }

    /// Record a pour entered by hand against a keg
    pub fn record_manual_pour(&self, keg_id: u32, volume: f64) -> Result<PourReceipt> {
        self.apply_pour(
            Uuid::new_v4(),
            |_| Ok(keg_id),
            None,
            volume,
            Utc::now(),
            PourSource::Manual,
        )
    }

    /// Pour history, newest first, at most `limit` entries
    pub fn pour_history(&self, limit: Option<usize>) -> Result<Vec<PourEvent>> {
        let mut events: Vec<PourEvent> = self.history.read_all()?;
        events.sort_by(|a, b| b.poured_at.cmp(&a.poured_at));
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        Ok(events)
    }
}

impl PourLedger for FileLedger {
    fn record_pour(&self, report: &PourReport) -> Result<PourReceipt> {
        self.apply_pour(
            report.id,
            |book| {
                book.tapped_at(report.tap).map(|k| k.id).ok_or_else(|| {
                    Error::LedgerDelivery(format!("no keg tapped at tap {}", report.tap))
                })
            },
            Some(report.tap),
            report.volume,
            report.ended_at,
            PourSource::FlowMeter,
        )
    }
}
