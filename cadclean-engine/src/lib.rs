pub mod command;
pub mod detect;
pub mod normalize;
pub mod pipeline;
pub mod sweep;

pub mod errors {
    use cadclean_core::errors::DocumentError;
    use thiserror::Error;

    use crate::pipeline::PipelineStage;

    #[derive(Debug, Error)]
    pub enum EngineError {
        #[error("container with id {0} not found")]
        ContainerNotFound(u64),
        #[error("discipline filter is empty; refusing to erase every entity")]
        EmptyDisciplineFilter,
        #[error(transparent)]
        Document(#[from] DocumentError),
    }

    /// 流水线阶段级错误。任何此类错误都会回滚当前阶段并清空流水线状态。
    #[derive(Debug, Error)]
    pub enum PipelineError {
        #[error("stage {found:?} requested while pipeline expects {expected:?}")]
        OutOfOrder {
            expected: PipelineStage,
            found: PipelineStage,
        },
        #[error("stage {0:?} cancelled by user")]
        Cancelled(PipelineStage),
        #[error("stage {stage:?} failed: {source}")]
        Fatal {
            stage: PipelineStage,
            #[source]
            source: EngineError,
        },
    }
}

pub mod scene {
    use std::collections::{BTreeSet, HashSet};
    use std::f64::consts::FRAC_PI_2;

    use cadclean_core::document::{
        DefinitionId, Document, Entity, EntityId, Line, ResourceId, ResourceKind,
        attribute_definition, block_reference, polyline, raster_image,
    };
    use cadclean_core::geometry::{Bounds2D, Point2, Vector2};
    use tracing::debug;

    use crate::errors::EngineError;

    /// 引擎层负责维护 `Document` 和运行时状态（选中集）。
    #[derive(Debug)]
    pub struct Scene {
        document: Document,
        selected: HashSet<EntityId>,
    }

    /// 演示图纸中的关键对象。
    #[derive(Debug, Clone)]
    pub struct DemoSheet {
        pub title_block: DefinitionId,
        pub title_block_reference: EntityId,
        pub arch_xref: DefinitionId,
        pub keyplan_xref: DefinitionId,
        pub border_xref: DefinitionId,
        pub scan: ResourceId,
        pub logo: ResourceId,
        pub outside: Vec<EntityId>,
    }

    impl Scene {
        pub fn new() -> Self {
            Self {
                document: Document::new(),
                selected: HashSet::new(),
            }
        }

        /// 替换当前文档并重置运行时状态。
        pub fn load_document(&mut self, document: Document) {
            self.document = document;
            self.selected.clear();
        }

        #[inline]
        pub fn selection_len(&self) -> usize {
            self.selected.len()
        }

        /// 以给定集合替换选中集，忽略已删除的实体。
        pub fn replace_selection<I>(&mut self, ids: I)
        where
            I: IntoIterator<Item = EntityId>,
        {
            self.selected.clear();
            for id in ids {
                if self.document.entity(id).is_some() {
                    self.selected.insert(id);
                }
            }
        }

        #[inline]
        pub fn clear_selection(&mut self) {
            self.selected.clear();
        }

        /// 丢弃选中集中已被删除的实体。
        pub fn prune_selection(&mut self) {
            let document = &self.document;
            self.selected.retain(|id| document.entity(*id).is_some());
        }

        /// 选中集的有序副本，作为保留集传给清理操作。
        pub fn selection_set(&self) -> BTreeSet<EntityId> {
            self.selected.iter().copied().collect()
        }

        /// 返回当前选中实体的包围盒。
        pub fn selection_bounds(&self) -> Option<Bounds2D> {
            let mut bounds = Bounds2D::empty();
            let mut has = false;
            for id in &self.selected {
                if let Some(entity_bounds) = self.document.entity_bounds(*id) {
                    bounds.include_bounds(&entity_bounds);
                    has = true;
                }
            }
            if has { Some(bounds) } else { None }
        }

        #[inline]
        pub fn document(&self) -> &Document {
            &self.document
        }

        #[inline]
        pub fn document_mut(&mut self) -> &mut Document {
            &mut self.document
        }

        /// 构造一张 ARCH E1 (42x30) 演示图纸：图框块、外部参照、图像与图框外的杂散图元。
        pub fn populate_demo_sheet(&mut self) -> Result<DemoSheet, EngineError> {
            self.clear_selection();
            let doc = &mut self.document;

            let title_block = doc.add_definition("TB-E1", Point2::new(0.0, 0.0));
            let frame = polyline(
                [
                    Point2::new(0.0, 0.0),
                    Point2::new(42.0, 0.0),
                    Point2::new(42.0, 30.0),
                    Point2::new(0.0, 30.0),
                ],
                true,
                "0",
            );
            let fields = [
                ("SHEET_NO", Point2::new(39.0, 2.0)),
                ("DRAWN_BY", Point2::new(39.0, 4.0)),
                ("SCALE", Point2::new(39.0, 6.0)),
                ("REV", Point2::new(39.0, 8.0)),
            ];
            let mut children = vec![frame];
            children.extend(
                fields
                    .iter()
                    .map(|(tag, insert)| attribute_definition(*tag, *insert, "0")),
            );
            for child in children {
                doc.add_entity_to(title_block, child)?;
            }

            let scan = doc.add_resource("survey-scan", ResourceKind::RasterImage, "scan.tif");
            let logo = doc.add_resource("LOGO", ResourceKind::RasterImage, "logo.png");

            let arch_xref = doc.add_external_definition("ARCH-BASE", "arch-base.dwg", false, true);
            doc.add_entity_to(
                arch_xref,
                Entity::Line(Line {
                    start: Point2::new(0.0, 0.0),
                    end: Point2::new(20.0, 0.0),
                    layer: "A-WALL".to_string(),
                }),
            )?;
            doc.add_entity_to(
                arch_xref,
                raster_image(scan, Point2::new(2.0, 2.0), Vector2::new(6.0, 4.0), "A-IMG"),
            )?;
            let keyplan_xref = doc.add_external_definition("KEYPLAN", "keyplan.dwg", true, false);
            let border_xref =
                doc.add_external_definition("TBLK-BORDER", "tblk-border.dwg", false, false);
            let consultant = doc.add_external_definition("MEP-CONSULT", "mep.dwg", true, false);

            let title_block_reference = doc.add_entity(block_reference(
                title_block,
                Point2::new(0.0, 0.0),
                Vector2::new(1.0, 1.0),
                0.0,
                "A-TTLB",
            ));
            doc.add_block_reference(arch_xref, Point2::new(4.0, 4.0), Vector2::new(1.0, 1.0), 0.0, "A-XREF");
            doc.add_block_reference(keyplan_xref, Point2::new(36.0, 24.0), Vector2::new(1.0, 1.0), 0.0, "A-XREF");
            doc.add_block_reference(border_xref, Point2::new(0.0, 0.0), Vector2::new(1.0, 1.0), 0.0, "A-TTLB");
            doc.add_block_reference(consultant, Point2::new(10.0, 10.0), Vector2::new(1.0, 1.0), 0.0, "M-XREF");
            doc.add_raster_image(logo, Point2::new(30.0, 1.0), Vector2::new(4.0, 2.0), "A-TTLB");
            doc.add_line(Point2::new(5.0, 15.0), Point2::new(25.0, 15.0), "A-WALL");
            doc.add_arc(Point2::new(15.0, 15.0), 3.0, 0.0, FRAC_PI_2, "A-DOOR");

            let outside = vec![
                doc.add_circle(Point2::new(120.0, 80.0), 4.0, "SCRATCH"),
                doc.add_text(Point2::new(-60.0, 12.0), "OLD NOTES", 2.5, "SCRATCH"),
                doc.add_line(Point2::new(70.0, 70.0), Point2::new(90.0, 95.0), "SCRATCH"),
            ];

            let sheet = DemoSheet {
                title_block,
                title_block_reference,
                arch_xref,
                keyplan_xref,
                border_xref,
                scan,
                logo,
                outside,
            };
            debug!(
                title_block = sheet.title_block.get(),
                reference = sheet.title_block_reference.get(),
                "已创建演示图纸"
            );
            Ok(sheet)
        }
    }

    impl Default for Scene {
        fn default() -> Self {
            Self::new()
        }
    }

}
