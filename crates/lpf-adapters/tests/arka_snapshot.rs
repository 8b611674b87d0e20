// Snapshot check for the bundled catalog fixtures: every record under
// fixtures/arka/sample must extract to the row recorded in snapshot.json.

use chrono::Utc;
use lpf_adapters::harvested_record;
use lpf_core::{usable_phone, TransferStatus};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct SnapshotRow {
    arka_id: i64,
    external_id: Option<String>,
    phone_number: Option<String>,
    owner_name: Option<String>,
}

fn sample_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/arka/sample")
}

fn read_json(name: &str) -> Value {
    let text = std::fs::read_to_string(sample_dir().join(name)).expect("read fixture");
    serde_json::from_str(&text).expect("parse fixture")
}

#[test]
fn arka_records_match_snapshot() {
    let snapshot: Vec<SnapshotRow> =
        serde_json::from_value(read_json("snapshot.json")).expect("snapshot rows");
    let sources = [(10042, "record.json"), (10043, "hidden_phone.json")];
    assert_eq!(snapshot.len(), sources.len());

    let fetched_at = Utc::now();
    for ((arka_id, file), expected) in sources.into_iter().zip(&snapshot) {
        let record = harvested_record(arka_id, read_json(file), fetched_at);
        assert_eq!(record.arka_id, expected.arka_id, "{file}");
        assert_eq!(record.external_id, expected.external_id, "{file}");
        assert_eq!(record.phone_number, expected.phone_number, "{file}");
        assert_eq!(record.owner_name, expected.owner_name, "{file}");
        assert_eq!(record.status, TransferStatus::NotTransferred);
        assert_eq!(record.transfer_attempt_count, 0);
    }
}

#[test]
fn hidden_phone_record_is_not_transferable_phone() {
    let record = harvested_record(10043, read_json("hidden_phone.json"), Utc::now());
    assert_eq!(record.phone_number.as_deref(), Some("09000000000"));
    assert_eq!(usable_phone(record.phone_number.as_deref()), None);
}
