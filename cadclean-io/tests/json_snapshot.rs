use std::collections::BTreeSet;

use cadclean_core::document::{Document, EntityId, ResourceKind};
use cadclean_core::geometry::{Point2, Vector2};
use cadclean_core::graph::SceneGraph;
use cadclean_io::{DocumentLoader, DocumentSaver, IoError, JsonFacade};

fn sample_sheet() -> (Document, EntityId) {
    let mut document = Document::new();
    document.add_polyline(
        [
            Point2::new(0.0, 0.0),
            Point2::new(42.0, 0.0),
            Point2::new(42.0, 30.0),
            Point2::new(0.0, 30.0),
        ],
        true,
        "A-TTLB",
    );
    document.add_attribute_definition("SHEET_NO", Point2::new(40.0, 2.0), "A-TTLB");
    let scan = document.add_resource("scan", ResourceKind::RasterImage, "scan.tif");
    document.add_dictionary_entry("ACAD_IMAGE_VARS", "scan-alias", scan);
    document.add_raster_image(scan, Point2::new(5.0, 5.0), Vector2::new(4.0, 3.0), "A-IMG");
    let keyplan = document.add_external_definition("KEYPLAN", "keyplan.dwg", true, false);
    document.add_block_reference(keyplan, Point2::new(30.0, 20.0), Vector2::new(1.0, 1.0), 0.0, "A-XREF");
    let scratch = document.add_circle(Point2::new(90.0, 90.0), 2.0, "SCRATCH");
    document.erase(scratch).unwrap();
    document.set_layer_locked("A-TTLB", true).unwrap();
    (document, scratch)
}

fn live(document: &Document) -> BTreeSet<EntityId> {
    document.entities().map(|(id, _)| id).collect()
}

#[test]
fn snapshot_survives_a_save_load_cycle() {
    let (document, scratch) = sample_sheet();
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("sheet.json");
    let facade = JsonFacade::new();

    facade.save(&document, &path).expect("save snapshot");
    let mut loaded = facade.load(&path).expect("load snapshot");

    assert_eq!(live(&loaded), live(&document));
    assert!(SceneGraph::is_erased(&loaded, scratch));
    assert!(loaded.layer("A-TTLB").unwrap().is_locked);
    assert_eq!(loaded.find_definitions("KEYPLAN").len(), 1);

    let scan = loaded.resources().next().expect("resource kept").id;
    assert_eq!(loaded.dictionary_entries(scan).len(), 2);
    assert_eq!(loaded.resource_references(scan).len(), 1);

    // 重新加载后分配的编号不得与已有实体冲突。
    let fresh = loaded.add_line(Point2::new(0.0, 0.0), Point2::new(1.0, 1.0), "0");
    assert!(!live(&document).contains(&fresh));
    assert_ne!(fresh, scratch);
}

#[test]
fn missing_file_reports_read_error() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("absent.json");
    let err = JsonFacade::new().load(&path).unwrap_err();
    match err {
        IoError::ReadError { path: reported, .. } => assert_eq!(reported, path),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn image_with_missing_resource_is_rejected() {
    let (document, _) = sample_sheet();
    let facade = JsonFacade::compact();
    let mut value: serde_json::Value =
        serde_json::from_str(&facade.encode(&document).unwrap()).unwrap();
    value["resources"] = serde_json::Value::Array(Vec::new());

    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("broken.json");
    std::fs::write(&path, value.to_string()).unwrap();
    let err = facade.load(&path).unwrap_err();
    assert!(matches!(err, IoError::InvalidDocument(_)));
}
