use std::path::PathBuf;

use fscr_adapters::{
    load_static_seed, JsonFileMediaCatalog, JsonFileRecordSource, MediaCatalog, RecordSource,
};

fn workspace_root() -> PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[tokio::test]
async fn spreadsheet_fixture_loads_with_source_ids() {
    let root = workspace_root();
    let path = root.join("fixtures/spreadsheet/sample.json");
    let source = JsonFileRecordSource::new("spreadsheet", path);
    let records = source.fetch_records().await.expect("spreadsheet fixture");

    assert_eq!(records.len(), 7);
    assert!(records.iter().all(|r| r.source_id == "spreadsheet"));
    let first = &records[0];
    assert_eq!(first.row_key, "r-001");
    assert_eq!(first.episode_number, Some(3));
    assert!(first.coordinates.is_some());
    assert_eq!(records[1].misses, vec!["two hour queue".to_string()]);
}

#[tokio::test]
async fn media_fixture_loads_every_catalog_entry() {
    let root = workspace_root();
    let path = root.join("fixtures/media/catalog.json");
    let catalog = JsonFileMediaCatalog::new("video-catalog", path);
    let items = catalog.fetch_catalog().await.expect("media fixture");

    assert_eq!(items.len(), 5);
    assert!(items.iter().all(|m| m.id.len() == 11));
    assert!(items.iter().all(|m| m.published_at.is_some()));
}

#[tokio::test]
async fn static_seed_has_a_primary_location_per_stall() {
    let seed = load_static_seed(workspace_root().join("seed/static_seed.json"))
        .await
        .expect("seed");

    assert_eq!(seed.len(), 2);
    for stall in &seed {
        assert_eq!(
            stall.locations.iter().filter(|l| l.is_primary).count(),
            1,
            "{} needs exactly one primary location",
            stall.name
        );
    }
}
