use std::collections::BTreeSet;
use std::f64::consts::PI;

use cadclean_core::document::{Document, EntityId, attribute_definition, polyline};
use cadclean_core::geometry::{Point2, Vector2};
use cadclean_core::graph::SceneGraph;
use cadclean_engine::detect::{DetectorSettings, Strategy, detect_title_block};
use cadclean_engine::sweep::{crop_to_title_block, keep_only, title_block_keep_set};

fn live_ids(document: &Document) -> BTreeSet<EntityId> {
    document.entities().map(|(id, _)| id).collect()
}

#[test]
fn title_block_is_detected_and_everything_else_is_swept() {
    let mut document = Document::new();
    let frame = document.add_polyline(
        [
            Point2::new(0.0, 0.0),
            Point2::new(30.0, 0.0),
            Point2::new(30.0, 42.0),
            Point2::new(0.0, 42.0),
        ],
        true,
        "Tblk",
    );
    let mut expected = BTreeSet::from([frame]);
    for (index, tag) in ["SHEET_NO", "DRAWN_BY", "SCALE", "REV"].iter().enumerate() {
        expected.insert(document.add_attribute_definition(
            *tag,
            Point2::new(26.0, 2.0 + 2.0 * index as f64),
            "Tblk",
        ));
    }
    document.add_circle(Point2::new(80.0, 80.0), 2.0, "SCRATCH");
    document.add_line(Point2::new(50.0, -10.0), Point2::new(60.0, -20.0), "SCRATCH");
    document.add_text(Point2::new(-20.0, 60.0), "OLD", 2.5, "SCRATCH");
    document.add_arc(Point2::new(100.0, 5.0), 3.0, 0.0, PI, "SCRATCH");
    let model = document.model_space();

    let settings = DetectorSettings::default();
    let candidate = detect_title_block(&document, model, &settings).unwrap();
    assert_eq!(candidate.strategy, Strategy::ClosedQuad);
    assert!(candidate.boundary.contains(&frame));
    let bounds = candidate.bounds();
    assert!(bounds.min().x().abs() < 1e-9 && bounds.min().y().abs() < 1e-9);
    assert!((bounds.max().x() - 30.0).abs() < 1e-9);
    assert!((bounds.max().y() - 42.0).abs() < 1e-9);
    assert!(candidate.card.has("title-layer"));
    assert!(candidate.card.has("sheet-ratio"));

    let retain = title_block_keep_set(&document, model, &candidate);
    let report = keep_only(&mut document, model, &retain).unwrap();
    assert_eq!(report.erased, 4);
    assert_eq!(live_ids(&document), expected);
}

#[test]
fn scored_quad_outranks_anchor_fallback() {
    let mut document = Document::new();
    for (index, tag) in ["SHEET_NO", "SCALE", "DATE"].iter().enumerate() {
        document.add_attribute_definition(*tag, Point2::new(40.0, 2.0 + 2.0 * index as f64), "0");
    }
    let model = document.model_space();
    let settings = DetectorSettings::default();
    let fallback = detect_title_block(&document, model, &settings).unwrap();
    assert_eq!(fallback.strategy, Strategy::AnchorCluster);
    assert!((fallback.score - 2.9).abs() < 1e-9);

    let frame = document.add_polyline(
        [
            Point2::new(0.0, 0.0),
            Point2::new(42.0, 0.0),
            Point2::new(42.0, 30.0),
            Point2::new(0.0, 30.0),
        ],
        true,
        "TITLE-BLOCK",
    );
    // 画面外的杂散线使正交图框重建失效，只比较闭合矩形与兜底候选。
    document.add_line(Point2::new(-50.0, 60.0), Point2::new(-40.0, 75.0), "0");
    let candidate = detect_title_block(&document, model, &settings).unwrap();
    assert_eq!(candidate.strategy, Strategy::ClosedQuad);
    assert_eq!(candidate.boundary, BTreeSet::from([frame]));
    assert!(candidate.score >= 6.1);
    assert!(candidate.score > fallback.score);
}

#[test]
fn title_block_inside_nested_block_is_found_after_normalization() {
    let mut document = Document::new();
    let sheet = document.add_definition("SHEET-E1", Point2::new(0.0, 0.0));
    let frame = document.add_definition("FRAME-E1", Point2::new(0.0, 0.0));
    document
        .add_entity_to(
            frame,
            polyline(
                [
                    Point2::new(0.0, 0.0),
                    Point2::new(21.0, 0.0),
                    Point2::new(21.0, 15.0),
                    Point2::new(0.0, 15.0),
                ],
                true,
                "0",
            ),
        )
        .unwrap();
    for (index, tag) in ["SHEET_NO", "REV", "SCALE"].iter().enumerate() {
        document
            .add_entity_to(
                frame,
                attribute_definition(*tag, Point2::new(19.0, 1.0 + index as f64), "0"),
            )
            .unwrap();
    }
    document
        .add_entity_to(
            sheet,
            cadclean_core::document::block_reference(
                frame,
                Point2::new(0.0, 0.0),
                Vector2::new(2.0, 2.0),
                0.0,
                "0",
            ),
        )
        .unwrap();
    document.add_block_reference(sheet, Point2::new(100.0, 50.0), Vector2::new(1.0, 1.0), 0.0, "A-TTLB");
    let stray = document.add_circle(Point2::new(0.0, 0.0), 1.0, "SCRATCH");
    let model = document.model_space();

    let outcome = crop_to_title_block(&mut document, model, &DetectorSettings::default())
        .unwrap()
        .unwrap();
    assert_eq!(outcome.normalize.exploded, 2);
    let bounds = outcome.candidate.bounds();
    assert!((bounds.min().x() - 100.0).abs() < 1e-9);
    assert!((bounds.max().x() - 142.0).abs() < 1e-9);
    assert!((bounds.max().y() - 80.0).abs() < 1e-9);
    assert!(SceneGraph::is_erased(&document, stray));
    assert_eq!(outcome.sweep.erased, 1);
    // 炸开后的图元继承最外层参照的图层。
    assert!(
        document
            .entities()
            .all(|(_, entity)| entity.layer_name() == "A-TTLB")
    );
}

#[test]
fn detection_twice_yields_identical_candidate() {
    let mut scene = cadclean_engine::scene::Scene::new();
    scene.populate_demo_sheet().unwrap();
    let document = scene.document_mut();
    let model = document.model_space();
    cadclean_engine::normalize::normalize(document, model).unwrap();

    let settings = DetectorSettings::default();
    let first = detect_title_block(&*document, model, &settings).unwrap();
    let second = detect_title_block(&*document, model, &settings).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.corners, second.corners);
    assert_eq!(first.score, second.score);
}

#[test]
fn title_block_reference_on_locked_layer_is_cropped() {
    let mut document = Document::new();
    let block = document.add_definition("TB", Point2::new(0.0, 0.0));
    document
        .add_entity_to(
            block,
            polyline(
                [
                    Point2::new(0.0, 0.0),
                    Point2::new(42.0, 0.0),
                    Point2::new(42.0, 30.0),
                    Point2::new(0.0, 30.0),
                ],
                true,
                "0",
            ),
        )
        .unwrap();
    for (index, tag) in ["SHEET_NO", "SCALE", "REV"].iter().enumerate() {
        document
            .add_entity_to(
                block,
                attribute_definition(*tag, Point2::new(40.0, 2.0 + 2.0 * index as f64), "0"),
            )
            .unwrap();
    }
    document.add_block_reference(block, Point2::new(0.0, 0.0), Vector2::new(1.0, 1.0), 0.0, "A-TTLB");
    document.set_layer_locked("A-TTLB", true).unwrap();
    let stray = document.add_circle(Point2::new(200.0, 200.0), 1.0, "SCRATCH");
    let model = document.model_space();

    let outcome = crop_to_title_block(&mut document, model, &DetectorSettings::default())
        .unwrap()
        .expect("locked title block should be detected");
    assert_eq!(outcome.normalize.exploded, 1);
    assert_eq!(outcome.normalize.skipped, 0);
    assert_eq!(outcome.candidate.strategy, Strategy::ClosedQuad);
    assert!(SceneGraph::is_erased(&document, stray));
    assert_eq!(document.entities().count(), 4);
    assert!(document.layer("A-TTLB").unwrap().is_locked);
}
