//! CSV export of pour history and kegs.
//!
//! Volumes are written in litres with an ounce column alongside, so the
//! files open cleanly in a spreadsheet without unit conversion.

use crate::{litres_to_ounces, Keg, PourEvent, PourSource, Result};
use std::fs::File;
use std::path::Path;

/// A row in the pour history CSV
#[derive(Debug, serde::Serialize)]
struct PourRow {
    id: String,
    keg_id: u32,
    tap: Option<u32>,
    poured_at: String,
    volume_litres: f64,
    volume_ounces: f64,
    source: &'static str,
}

impl From<&PourEvent> for PourRow {
    fn from(event: &PourEvent) -> Self {
        PourRow {
            id: event.id.to_string(),
            keg_id: event.keg_id,
            tap: event.tap,
            poured_at: event.poured_at.to_rfc3339(),
            volume_litres: round_to(event.volume, 4),
            volume_ounces: round_to(litres_to_ounces(event.volume), 2),
            source: match event.source {
                PourSource::FlowMeter => "flow_meter",
                PourSource::Manual => "manual",
            },
        }
    }
}

/// A row in the keg CSV
#[derive(Debug, serde::Serialize)]
struct KegRow {
    id: u32,
    name: String,
    style: String,
    abv: f64,
    status: &'static str,
    tap: Option<u32>,
    volume_remaining: f64,
    original_volume: f64,
    date_created: String,
    date_last_tapped: Option<String>,
    date_finished: Option<String>,
}

impl From<&Keg> for KegRow {
    fn from(keg: &Keg) -> Self {
        KegRow {
            id: keg.id,
            name: keg.name.clone(),
            style: keg.style.clone(),
            abv: keg.abv,
            status: keg.status.as_str(),
            tap: keg.tap_position,
            volume_remaining: round_to(keg.volume_remaining, 4),
            original_volume: keg.original_volume,
            date_created: keg.date_created.to_rfc3339(),
            date_last_tapped: keg.date_last_tapped.map(|t| t.to_rfc3339()),
            date_finished: keg.date_finished.map(|t| t.to_rfc3339()),
        }
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn write_rows<R: serde::Serialize>(path: &Path, rows: impl Iterator<Item = R>) -> Result<usize> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    let mut writer = csv::Writer::from_writer(file);

    let mut count = 0;
    for row in rows {
        writer.serialize(row)?;
        count += 1;
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.sync_all()?;
    Ok(count)
}

/// Write pour history to `path`, replacing any existing file.
/// Returns the number of rows written.
pub fn export_pours(events: &[PourEvent], path: &Path) -> Result<usize> {
    let count = write_rows(path, events.iter().map(PourRow::from))?;
    tracing::info!("Exported {} pours to {:?}", count, path);
    Ok(count)
}

/// Write the keg list to `path`, replacing any existing file
pub fn export_kegs(kegs: &[Keg], path: &Path) -> Result<usize> {
    let count = write_rows(path, kegs.iter().map(KegRow::from))?;
    tracing::info!("Exported {} kegs to {:?}", count, path);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KegStatus;
    use chrono::Utc;
    use uuid::Uuid;

    fn event(volume: f64, source: PourSource) -> PourEvent {
        PourEvent {
            id: Uuid::new_v4(),
            keg_id: 1,
            tap: matches!(source, PourSource::FlowMeter).then_some(2),
            volume,
            poured_at: Utc::now(),
            source,
        }
    }

    #[test]
    fn test_export_pours() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("out/pours.csv");
        let events = vec![
            event(0.473, PourSource::FlowMeter),
            event(0.3, PourSource::Manual),
        ];

        assert_eq!(export_pours(&events, &path).unwrap(), 2);

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "id");
        assert_eq!(&headers[6], "source");

        let records: Vec<_> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(&records[0][2], "2");
        assert_eq!(&records[0][5], "15.99");
        assert_eq!(&records[1][2], "");
        assert_eq!(&records[1][6], "manual");
    }

    #[test]
    fn test_export_replaces_previous_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("pours.csv");
        export_pours(&vec![event(0.1, PourSource::Manual); 3], &path).unwrap();
        export_pours(&[event(0.1, PourSource::Manual)], &path).unwrap();

        let reader = csv::Reader::from_path(&path).unwrap();
        assert_eq!(reader.into_records().count(), 1);
    }

    #[test]
    fn test_export_kegs() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("kegs.csv");
        let keg = Keg {
            id: 7,
            name: "Dunkel".into(),
            style: "Dark Lager".into(),
            abv: 5.3,
            volume_remaining: 12.25,
            original_volume: 19.0,
            status: KegStatus::Tapped,
            tap_position: Some(3),
            date_created: Utc::now(),
            date_last_tapped: Some(Utc::now()),
            date_finished: None,
        };

        assert_eq!(export_kegs(&[keg], &path).unwrap(), 1);
        let mut reader = csv::Reader::from_path(&path).unwrap();
        let record = reader.records().next().unwrap().unwrap();
        assert_eq!(&record[1], "Dunkel");
        assert_eq!(&record[4], "tapped");
        assert_eq!(&record[5], "3");
    }

    #[test]
    fn test_export_empty_writes_nothing_but_succeeds() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("pours.csv");
        assert_eq!(export_pours(&[], &path).unwrap(), 0);
        assert!(path.exists());
    }
}
