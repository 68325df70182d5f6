use std::collections::BTreeMap;
use std::f64::consts::{FRAC_PI_2, PI, TAU};

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::errors::DocumentError;
use crate::geometry::{Bounds2D, Point2, Transform2, Vector2};

/// 模型空间块记录名称。
pub const MODEL_SPACE: &str = "*Model_Space";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    #[inline]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// 提供原始数值，便于序列化或日志输出。
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DefinitionId(u64);

impl DefinitionId {
    #[inline]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(u64);

impl ResourceId {
    #[inline]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub is_visible: bool,
    #[serde(default)]
    pub is_locked: bool,
}

impl Layer {
    #[inline]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_visible: true,
            is_locked: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Entity {
    Line(Line),
    Circle(Circle),
    Arc(Arc),
    Polyline(Polyline),
    Text(Text),
    AttributeDefinition(AttributeDefinition),
    BlockReference(BlockReference),
    RasterImage(RasterImage),
    Underlay(Underlay),
    Proxy(ProxyEntity),
}

impl Entity {
    #[inline]
    pub fn layer_name(&self) -> &str {
        match self {
            Entity::Line(line) => &line.layer,
            Entity::Circle(circle) => &circle.layer,
            Entity::Arc(arc) => &arc.layer,
            Entity::Polyline(polyline) => &polyline.layer,
            Entity::Text(text) => &text.layer,
            Entity::AttributeDefinition(attdef) => &attdef.layer,
            Entity::BlockReference(reference) => &reference.layer,
            Entity::RasterImage(image) => &image.layer,
            Entity::Underlay(underlay) => &underlay.layer,
            Entity::Proxy(proxy) => &proxy.layer,
        }
    }

    pub fn set_layer(&mut self, layer: impl Into<String>) {
        let layer = layer.into();
        match self {
            Entity::Line(line) => line.layer = layer,
            Entity::Circle(circle) => circle.layer = layer,
            Entity::Arc(arc) => arc.layer = layer,
            Entity::Polyline(polyline) => polyline.layer = layer,
            Entity::Text(text) => text.layer = layer,
            Entity::AttributeDefinition(attdef) => attdef.layer = layer,
            Entity::BlockReference(reference) => reference.layer = layer,
            Entity::RasterImage(image) => image.layer = layer,
            Entity::Underlay(underlay) => underlay.layer = layer,
            Entity::Proxy(proxy) => proxy.layer = layer,
        }
    }

    /// 引用的外部资源定义（光栅图像或参考底图）。
    pub fn resource(&self) -> Option<ResourceId> {
        match self {
            Entity::RasterImage(image) => Some(image.resource),
            Entity::Underlay(underlay) => Some(underlay.resource),
            _ => None,
        }
    }

    /// 计算实体自身的 2D 轴对齐范围。块参照的范围依赖块定义，需由文档计算，此处返回 `None`。
    pub fn bounds(&self) -> Option<Bounds2D> {
        let mut bounds = Bounds2D::empty();
        match self {
            Entity::Line(line) => {
                bounds.include_point(line.start);
                bounds.include_point(line.end);
            }
            Entity::Circle(circle) => {
                let radius = circle.radius.abs();
                let center = circle.center;
                bounds.include_point(Point2::new(center.x() - radius, center.y() - radius));
                bounds.include_point(Point2::new(center.x() + radius, center.y() + radius));
            }
            Entity::Arc(arc) => arc_bounds(arc, &mut bounds),
            Entity::Polyline(polyline) => {
                let count = polyline.vertices.len();
                for (index, vertex) in polyline.vertices.iter().enumerate() {
                    bounds.include_point(vertex.position);
                    let next = if index + 1 < count {
                        Some(&polyline.vertices[index + 1])
                    } else if polyline.is_closed && count > 1 {
                        Some(&polyline.vertices[0])
                    } else {
                        None
                    };
                    if let Some(next) = next {
                        polyline_segment_bounds(
                            vertex.position,
                            next.position,
                            vertex.bulge,
                            &mut bounds,
                        );
                    }
                }
            }
            Entity::Text(text) => bounds.include_point(text.insert),
            Entity::AttributeDefinition(attdef) => bounds.include_point(attdef.insert),
            Entity::BlockReference(_) => return None,
            Entity::RasterImage(image) => {
                include_frame_bounds(
                    &mut bounds,
                    image.insert,
                    image.u_vector,
                    image.v_vector,
                    image.image_size,
                );
            }
            Entity::Underlay(underlay) => {
                let extents = underlay.extents?;
                let transform = Transform2::new(
                    Point2::new(0.0, 0.0),
                    underlay.insert,
                    underlay.scale,
                    underlay.rotation,
                );
                let min = extents.min();
                let max = extents.max();
                for corner in [
                    min,
                    Point2::new(max.x(), min.y()),
                    max,
                    Point2::new(min.x(), max.y()),
                ] {
                    bounds.include_point(transform.apply(corner));
                }
            }
            Entity::Proxy(proxy) => return proxy.extents,
        }
        if bounds.is_empty() {
            None
        } else {
            Some(bounds)
        }
    }

    /// 将实体按块插入变换映射到世界坐标。无法精确表达的组合（如非等比缩放下的圆、
    /// 带凸度的多段线）以及代理对象返回 `None`。
    pub fn transformed(&self, transform: &Transform2) -> Option<Entity> {
        let uniform = transform.is_uniform();
        let mirrored = transform.is_mirrored();
        let factor = transform.scale.x().abs();
        let entity = match self {
            Entity::Line(line) => Entity::Line(Line {
                start: transform.apply(line.start),
                end: transform.apply(line.end),
                layer: line.layer.clone(),
            }),
            Entity::Circle(circle) => {
                if !uniform {
                    return None;
                }
                Entity::Circle(Circle {
                    center: transform.apply(circle.center),
                    radius: circle.radius.abs() * factor,
                    layer: circle.layer.clone(),
                })
            }
            Entity::Arc(arc) => {
                if !uniform {
                    return None;
                }
                let center = transform.apply(arc.center);
                let start = transform.apply(arc_point(arc.center, arc.radius, arc.start_angle));
                let end = transform.apply(arc_point(arc.center, arc.radius, arc.end_angle));
                let start_dir = start.as_vec2() - center.as_vec2();
                let end_dir = end.as_vec2() - center.as_vec2();
                let mut start_angle = start_dir.y.atan2(start_dir.x);
                let mut end_angle = end_dir.y.atan2(end_dir.x);
                if mirrored {
                    std::mem::swap(&mut start_angle, &mut end_angle);
                }
                Entity::Arc(Arc {
                    center,
                    radius: arc.radius.abs() * factor,
                    start_angle,
                    end_angle,
                    layer: arc.layer.clone(),
                })
            }
            Entity::Polyline(polyline) => {
                let has_bulge = polyline.vertices.iter().any(|v| v.bulge.abs() > 1e-9);
                if has_bulge && !uniform {
                    return None;
                }
                let vertices = polyline
                    .vertices
                    .iter()
                    .map(|vertex| PolylineVertex {
                        position: transform.apply(vertex.position),
                        bulge: if mirrored { -vertex.bulge } else { vertex.bulge },
                    })
                    .collect();
                Entity::Polyline(Polyline {
                    vertices,
                    is_closed: polyline.is_closed,
                    layer: polyline.layer.clone(),
                })
            }
            Entity::Text(text) => Entity::Text(Text {
                insert: transform.apply(text.insert),
                content: text.content.clone(),
                height: text.height * transform.scale.y().abs(),
                rotation: text.rotation + transform.rotation,
                layer: text.layer.clone(),
            }),
            Entity::AttributeDefinition(attdef) => {
                Entity::AttributeDefinition(AttributeDefinition {
                    tag: attdef.tag.clone(),
                    prompt: attdef.prompt.clone(),
                    default_text: attdef.default_text.clone(),
                    insert: transform.apply(attdef.insert),
                    height: attdef.height * transform.scale.y().abs(),
                    layer: attdef.layer.clone(),
                })
            }
            Entity::BlockReference(reference) => Entity::BlockReference(BlockReference {
                definition: reference.definition,
                insert: transform.apply(reference.insert),
                scale: Vector2::new(
                    reference.scale.x() * transform.scale.x(),
                    reference.scale.y() * transform.scale.y(),
                ),
                rotation: reference.rotation + transform.rotation,
                attributes: reference
                    .attributes
                    .iter()
                    .map(|attribute| Attribute {
                        tag: attribute.tag.clone(),
                        text: attribute.text.clone(),
                        insert: transform.apply(attribute.insert),
                        height: attribute.height * transform.scale.y().abs(),
                        layer: attribute.layer.clone(),
                    })
                    .collect(),
                layer: reference.layer.clone(),
            }),
            Entity::RasterImage(image) => Entity::RasterImage(RasterImage {
                resource: image.resource,
                insert: transform.apply(image.insert),
                u_vector: transform.apply_vector(image.u_vector),
                v_vector: transform.apply_vector(image.v_vector),
                image_size: image.image_size,
                layer: image.layer.clone(),
            }),
            Entity::Underlay(underlay) => Entity::Underlay(Underlay {
                resource: underlay.resource,
                insert: transform.apply(underlay.insert),
                scale: Vector2::new(
                    underlay.scale.x() * transform.scale.x(),
                    underlay.scale.y() * transform.scale.y(),
                ),
                rotation: underlay.rotation + transform.rotation,
                extents: underlay.extents,
                layer: underlay.layer.clone(),
            }),
            Entity::Proxy(_) => return None,
        };
        Some(entity)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Line {
    pub start: Point2,
    pub end: Point2,
    pub layer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Circle {
    pub center: Point2,
    pub radius: f64,
    pub layer: String,
}

/// 圆弧实体，角度以弧度形式储存，遵循数学正方向。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Arc {
    pub center: Point2,
    pub radius: f64,
    pub start_angle: f64,
    pub end_angle: f64,
    pub layer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Polyline {
    pub vertices: Vec<PolylineVertex>,
    pub is_closed: bool,
    pub layer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolylineVertex {
    pub position: Point2,
    pub bulge: f64,
}

impl PolylineVertex {
    #[inline]
    pub fn new(position: Point2) -> Self {
        Self {
            position,
            bulge: 0.0,
        }
    }

    #[inline]
    pub fn with_bulge(position: Point2, bulge: f64) -> Self {
        Self { position, bulge }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Text {
    pub insert: Point2,
    pub content: String,
    pub height: f64,
    pub rotation: f64,
    pub layer: String,
}

/// 属性定义。带标签的插入点是图框识别的锚点。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeDefinition {
    pub tag: String,
    pub prompt: Option<String>,
    pub default_text: String,
    pub insert: Point2,
    pub height: f64,
    pub layer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attribute {
    pub tag: String,
    pub text: String,
    pub insert: Point2,
    pub height: f64,
    pub layer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockReference {
    pub definition: DefinitionId,
    pub insert: Point2,
    pub scale: Vector2,
    pub rotation: f64,
    pub attributes: Vec<Attribute>,
    pub layer: String,
}

impl BlockReference {
    pub fn transform(&self, base_point: Point2) -> Transform2 {
        Transform2::new(base_point, self.insert, self.scale, self.rotation)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RasterImage {
    pub resource: ResourceId,
    pub insert: Point2,
    pub u_vector: Vector2,
    pub v_vector: Vector2,
    pub image_size: Vector2,
    pub layer: String,
}

/// PDF/DWF/DGN 参考底图。`extents` 为底图本地坐标范围，未加载时为空。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Underlay {
    pub resource: ResourceId,
    pub insert: Point2,
    pub scale: Vector2,
    pub rotation: f64,
    pub extents: Option<Bounds2D>,
    pub layer: String,
}

/// 第三方应用创建、本程序无法解释的对象。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyEntity {
    pub class_name: String,
    pub extents: Option<Bounds2D>,
    pub layer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub owner: DefinitionId,
    pub entity: Entity,
    #[serde(default)]
    pub is_erased: bool,
}

/// 块记录。模型空间与布局同样以块记录表示（`is_layout`）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Definition {
    pub id: DefinitionId,
    pub name: String,
    pub base_point: Point2,
    #[serde(default)]
    pub is_external: bool,
    #[serde(default)]
    pub is_overlay: bool,
    #[serde(default)]
    pub is_layout: bool,
    /// 外部参照是否已成功加载。
    #[serde(default)]
    pub is_resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    pub entities: Vec<EntityId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    RasterImage,
    PdfUnderlay,
    DwfUnderlay,
    DgnUnderlay,
}

impl ResourceKind {
    /// 命名对象字典中登记该类资源的字典名。
    pub fn dictionary_name(self) -> &'static str {
        match self {
            ResourceKind::RasterImage => "ACAD_IMAGE_DICT",
            ResourceKind::PdfUnderlay => "ACAD_PDFDEFINITIONS",
            ResourceKind::DwfUnderlay => "ACAD_DWFDEFINITIONS",
            ResourceKind::DgnUnderlay => "ACAD_DGNDEFINITIONS",
        }
    }
}

/// 外部资源定义（光栅图像、参考底图），被零个或多个可见实体引用。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalResource {
    pub id: ResourceId,
    pub name: String,
    pub kind: ResourceKind,
    pub source_path: String,
    #[serde(default)]
    pub is_erased: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DictionaryKey {
    pub dictionary: String,
    pub entry: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "DocumentData", into = "DocumentData")]
pub struct Document {
    layers: BTreeMap<String, Layer>,
    definitions: BTreeMap<DefinitionId, Definition>,
    entities: BTreeMap<EntityId, EntityRecord>,
    resources: BTreeMap<ResourceId, ExternalResource>,
    dictionaries: BTreeMap<String, BTreeMap<String, ResourceId>>,
    model_space: DefinitionId,
    next_entity_id: u64,
    next_definition_id: u64,
    next_resource_id: u64,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        let model_space = DefinitionId(0);
        let mut definitions = BTreeMap::new();
        definitions.insert(
            model_space,
            Definition {
                id: model_space,
                name: MODEL_SPACE.to_string(),
                base_point: Point2::new(0.0, 0.0),
                is_external: false,
                is_overlay: false,
                is_layout: true,
                is_resolved: true,
                source_path: None,
                entities: Vec::new(),
            },
        );
        let mut doc = Self {
            layers: BTreeMap::new(),
            definitions,
            entities: BTreeMap::new(),
            resources: BTreeMap::new(),
            dictionaries: BTreeMap::new(),
            model_space,
            next_entity_id: 0,
            next_definition_id: 1,
            next_resource_id: 0,
        };
        doc.ensure_layer("0");
        doc
    }

    pub fn ensure_layer(&mut self, name: impl AsRef<str>) {
        let key = name.as_ref();
        self.layers
            .entry(key.to_string())
            .or_insert_with(|| Layer::new(key));
    }

    #[inline]
    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.values()
    }

    #[inline]
    pub fn model_space_id(&self) -> DefinitionId {
        self.model_space
    }

    /// 新建普通块定义。
    pub fn add_definition(&mut self, name: impl Into<String>, base_point: Point2) -> DefinitionId {
        self.insert_definition(name.into(), base_point, false, false, false, true, None)
    }

    /// 新建布局（图纸空间）块记录。
    pub fn add_layout(&mut self, name: impl Into<String>) -> DefinitionId {
        self.insert_definition(
            name.into(),
            Point2::new(0.0, 0.0),
            false,
            false,
            true,
            true,
            None,
        )
    }

    /// 新建外部参照块定义。`is_resolved` 表示外部文件是否已加载。
    pub fn add_external_definition(
        &mut self,
        name: impl Into<String>,
        source_path: impl Into<String>,
        is_overlay: bool,
        is_resolved: bool,
    ) -> DefinitionId {
        self.insert_definition(
            name.into(),
            Point2::new(0.0, 0.0),
            true,
            is_overlay,
            false,
            is_resolved,
            Some(source_path.into()),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_definition(
        &mut self,
        name: String,
        base_point: Point2,
        is_external: bool,
        is_overlay: bool,
        is_layout: bool,
        is_resolved: bool,
        source_path: Option<String>,
    ) -> DefinitionId {
        let id = DefinitionId(self.next_definition_id);
        self.next_definition_id += 1;
        self.definitions.insert(
            id,
            Definition {
                id,
                name,
                base_point,
                is_external,
                is_overlay,
                is_layout,
                is_resolved,
                source_path,
                entities: Vec::new(),
            },
        );
        id
    }

    #[inline]
    pub fn definitions(&self) -> impl Iterator<Item = &Definition> {
        self.definitions.values()
    }

    #[inline]
    pub fn definition_by_id(&self, id: DefinitionId) -> Option<&Definition> {
        self.definitions.get(&id)
    }

    /// 注册外部资源定义，并登记到对应的命名字典。
    pub fn add_resource(
        &mut self,
        name: impl Into<String>,
        kind: ResourceKind,
        source_path: impl Into<String>,
    ) -> ResourceId {
        let id = ResourceId(self.next_resource_id);
        self.next_resource_id += 1;
        let name = name.into();
        self.dictionaries
            .entry(kind.dictionary_name().to_string())
            .or_default()
            .insert(name.clone(), id);
        self.resources.insert(
            id,
            ExternalResource {
                id,
                name,
                kind,
                source_path: source_path.into(),
                is_erased: false,
            },
        );
        id
    }

    /// 在额外的字典中登记资源（例如多个名称指向同一定义）。
    pub fn add_dictionary_entry(
        &mut self,
        dictionary: impl Into<String>,
        entry: impl Into<String>,
        resource: ResourceId,
    ) {
        self.dictionaries
            .entry(dictionary.into())
            .or_default()
            .insert(entry.into(), resource);
    }

    #[inline]
    pub fn resources(&self) -> impl Iterator<Item = &ExternalResource> {
        self.resources.values().filter(|resource| !resource.is_erased)
    }

    /// 向指定容器追加实体。
    pub fn add_entity_to(
        &mut self,
        container: DefinitionId,
        entity: Entity,
    ) -> Result<EntityId, DocumentError> {
        if !self.definitions.contains_key(&container) {
            return Err(DocumentError::DefinitionNotFound(container.get()));
        }
        self.ensure_layer(entity.layer_name());
        if let Entity::BlockReference(reference) = &entity {
            for attribute in &reference.attributes {
                self.ensure_layer(&attribute.layer);
            }
        }
        let id = self.next_id();
        self.entities.insert(
            id,
            EntityRecord {
                id,
                owner: container,
                entity,
                is_erased: false,
            },
        );
        if let Some(definition) = self.definitions.get_mut(&container) {
            definition.entities.push(id);
        }
        Ok(id)
    }

    /// 向模型空间追加实体。模型空间始终存在。
    pub fn add_entity(&mut self, entity: Entity) -> EntityId {
        let model_space = self.model_space;
        let id = self.next_id();
        self.ensure_layer(entity.layer_name());
        self.entities.insert(
            id,
            EntityRecord {
                id,
                owner: model_space,
                entity,
                is_erased: false,
            },
        );
        if let Some(definition) = self.definitions.get_mut(&model_space) {
            definition.entities.push(id);
        }
        id
    }

    pub fn add_line(&mut self, start: Point2, end: Point2, layer: impl Into<String>) -> EntityId {
        self.add_entity(Entity::Line(Line {
            start,
            end,
            layer: layer.into(),
        }))
    }

    pub fn add_circle(&mut self, center: Point2, radius: f64, layer: impl Into<String>) -> EntityId {
        self.add_entity(Entity::Circle(Circle {
            center,
            radius,
            layer: layer.into(),
        }))
    }

    pub fn add_arc(
        &mut self,
        center: Point2,
        radius: f64,
        start_angle: f64,
        end_angle: f64,
        layer: impl Into<String>,
    ) -> EntityId {
        self.add_entity(Entity::Arc(Arc {
            center,
            radius,
            start_angle,
            end_angle,
            layer: layer.into(),
        }))
    }

    pub fn add_polyline<I>(&mut self, points: I, is_closed: bool, layer: impl Into<String>) -> EntityId
    where
        I: IntoIterator<Item = Point2>,
    {
        self.add_entity(polyline(points, is_closed, layer))
    }

    pub fn add_text(
        &mut self,
        insert: Point2,
        content: impl Into<String>,
        height: f64,
        layer: impl Into<String>,
    ) -> EntityId {
        self.add_entity(Entity::Text(Text {
            insert,
            content: content.into(),
            height,
            rotation: 0.0,
            layer: layer.into(),
        }))
    }

    pub fn add_attribute_definition(
        &mut self,
        tag: impl Into<String>,
        insert: Point2,
        layer: impl Into<String>,
    ) -> EntityId {
        self.add_entity(attribute_definition(tag, insert, layer))
    }

    pub fn add_block_reference(
        &mut self,
        definition: DefinitionId,
        insert: Point2,
        scale: Vector2,
        rotation: f64,
        layer: impl Into<String>,
    ) -> EntityId {
        self.add_entity(block_reference(definition, insert, scale, rotation, layer))
    }

    pub fn add_raster_image(
        &mut self,
        resource: ResourceId,
        insert: Point2,
        size: Vector2,
        layer: impl Into<String>,
    ) -> EntityId {
        self.add_entity(raster_image(resource, insert, size, layer))
    }

    #[inline]
    pub fn record(&self, id: EntityId) -> Option<&EntityRecord> {
        self.entities.get(&id)
    }

    /// 按 ID 查找未删除的实体。
    #[inline]
    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities
            .get(&id)
            .filter(|record| !record.is_erased)
            .map(|record| &record.entity)
    }

    /// 按插入顺序遍历容器中未删除的实体。
    pub fn entities_in(&self, container: DefinitionId) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.definitions
            .get(&container)
            .into_iter()
            .flat_map(|definition| definition.entities.iter())
            .filter_map(|id| {
                self.entities
                    .get(id)
                    .filter(|record| !record.is_erased)
                    .map(|record| (record.id, &record.entity))
            })
    }

    /// 模型空间中未删除的实体。
    pub fn entities(&self) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.entities_in(self.model_space)
    }

    /// 模型空间整体范围。
    pub fn bounds(&self) -> Option<Bounds2D> {
        let mut bounds = Bounds2D::empty();
        let mut has = false;
        for (id, _) in self.entities() {
            if let Some(entity_bounds) = self.entity_bounds(id) {
                bounds.include_bounds(&entity_bounds);
                has = true;
            }
        }
        if has { Some(bounds) } else { None }
    }

    /// 实体的世界坐标范围；块参照递归展开其定义，嵌套深度受限。
    pub fn entity_bounds(&self, id: EntityId) -> Option<Bounds2D> {
        let entity = self.entity(id)?;
        self.resolve_bounds(entity, None, 0)
    }

    fn resolve_bounds(
        &self,
        entity: &Entity,
        transform: Option<&Transform2>,
        depth: usize,
    ) -> Option<Bounds2D> {
        const MAX_DEPTH: usize = 16;
        if depth > MAX_DEPTH {
            return None;
        }
        let owned;
        let entity = match transform {
            Some(transform) => {
                owned = entity.transformed(transform)?;
                &owned
            }
            None => entity,
        };
        let Entity::BlockReference(reference) = entity else {
            return entity.bounds();
        };
        let definition = self.definitions.get(&reference.definition)?;
        if definition.is_external && !definition.is_resolved {
            return None;
        }
        let child_transform = reference.transform(definition.base_point);
        let mut bounds = Bounds2D::empty();
        let mut has = false;
        for child_id in &definition.entities {
            let Some(record) = self.entities.get(child_id).filter(|r| !r.is_erased) else {
                continue;
            };
            if let Some(child) =
                self.resolve_bounds(&record.entity, Some(&child_transform), depth + 1)
            {
                bounds.include_bounds(&child);
                has = true;
            }
        }
        for attribute in &reference.attributes {
            bounds.include_point(attribute.insert);
            has = true;
        }
        if has { Some(bounds) } else { None }
    }

    #[inline]
    fn next_id(&mut self) -> EntityId {
        let id = self.next_entity_id;
        self.next_entity_id += 1;
        EntityId(id)
    }

    pub(crate) fn layer_mut(&mut self, name: &str) -> Option<&mut Layer> {
        self.layers.get_mut(name)
    }

    pub(crate) fn layer_ref(&self, name: &str) -> Option<&Layer> {
        self.layers.get(name)
    }

    pub(crate) fn record_mut(&mut self, id: EntityId) -> Option<&mut EntityRecord> {
        self.entities.get_mut(&id)
    }

    pub(crate) fn remove_definition(&mut self, id: DefinitionId) -> Option<Definition> {
        self.definitions.remove(&id)
    }

    pub(crate) fn resource_mut(&mut self, id: ResourceId) -> Option<&mut ExternalResource> {
        self.resources.get_mut(&id)
    }

    pub(crate) fn resource_ref(&self, id: ResourceId) -> Option<&ExternalResource> {
        self.resources.get(&id)
    }

    pub(crate) fn dictionaries(&self) -> &BTreeMap<String, BTreeMap<String, ResourceId>> {
        &self.dictionaries
    }

    pub(crate) fn dictionaries_mut(&mut self) -> &mut BTreeMap<String, BTreeMap<String, ResourceId>> {
        &mut self.dictionaries
    }

    pub(crate) fn live_records(&self) -> impl Iterator<Item = &EntityRecord> {
        self.entities.values().filter(|record| !record.is_erased)
    }

    pub(crate) fn live_records_mut(&mut self) -> impl Iterator<Item = &mut EntityRecord> {
        self.entities.values_mut().filter(|record| !record.is_erased)
    }

    pub(crate) fn insert_local_definition(
        &mut self,
        name: String,
        base_point: Point2,
    ) -> DefinitionId {
        self.insert_definition(name, base_point, false, false, false, true, None)
    }
}

/// 构造多段线实体（无凸度）。
pub fn polyline<I>(points: I, is_closed: bool, layer: impl Into<String>) -> Entity
where
    I: IntoIterator<Item = Point2>,
{
    Entity::Polyline(Polyline {
        vertices: points.into_iter().map(PolylineVertex::new).collect(),
        is_closed,
        layer: layer.into(),
    })
}

pub fn attribute_definition(
    tag: impl Into<String>,
    insert: Point2,
    layer: impl Into<String>,
) -> Entity {
    let tag = tag.into();
    Entity::AttributeDefinition(AttributeDefinition {
        prompt: Some(tag.clone()),
        default_text: String::new(),
        tag,
        insert,
        height: 2.5,
        layer: layer.into(),
    })
}

pub fn block_reference(
    definition: DefinitionId,
    insert: Point2,
    scale: Vector2,
    rotation: f64,
    layer: impl Into<String>,
) -> Entity {
    Entity::BlockReference(BlockReference {
        definition,
        insert,
        scale,
        rotation,
        attributes: Vec::new(),
        layer: layer.into(),
    })
}

pub fn raster_image(
    resource: ResourceId,
    insert: Point2,
    size: Vector2,
    layer: impl Into<String>,
) -> Entity {
    Entity::RasterImage(RasterImage {
        resource,
        insert,
        u_vector: Vector2::new(1.0, 0.0),
        v_vector: Vector2::new(0.0, 1.0),
        image_size: size,
        layer: layer.into(),
    })
}

/// 序列化用的扁平结构，避免以新类型 ID 作为 JSON 键。
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentData {
    layers: Vec<Layer>,
    definitions: Vec<Definition>,
    entities: Vec<EntityRecord>,
    resources: Vec<ExternalResource>,
    #[serde(default)]
    dictionaries: BTreeMap<String, BTreeMap<String, ResourceId>>,
    model_space: DefinitionId,
}

impl From<Document> for DocumentData {
    fn from(document: Document) -> Self {
        Self {
            layers: document.layers.into_values().collect(),
            definitions: document.definitions.into_values().collect(),
            entities: document.entities.into_values().collect(),
            resources: document.resources.into_values().collect(),
            dictionaries: document.dictionaries,
            model_space: document.model_space,
        }
    }
}

impl From<DocumentData> for Document {
    fn from(data: DocumentData) -> Self {
        let next_entity_id = data.entities.iter().map(|r| r.id.get() + 1).max().unwrap_or(0);
        let next_definition_id = data
            .definitions
            .iter()
            .map(|d| d.id.get() + 1)
            .max()
            .unwrap_or(0)
            .max(data.model_space.get() + 1);
        let next_resource_id = data.resources.iter().map(|r| r.id.get() + 1).max().unwrap_or(0);
        let mut document = Self {
            layers: data
                .layers
                .into_iter()
                .map(|layer| (layer.name.clone(), layer))
                .collect(),
            definitions: data
                .definitions
                .into_iter()
                .map(|definition| (definition.id, definition))
                .collect(),
            entities: data
                .entities
                .into_iter()
                .map(|record| (record.id, record))
                .collect(),
            resources: data
                .resources
                .into_iter()
                .map(|resource| (resource.id, resource))
                .collect(),
            dictionaries: data.dictionaries,
            model_space: data.model_space,
            next_entity_id,
            next_definition_id,
            next_resource_id,
        };
        if !document.definitions.contains_key(&document.model_space) {
            let id = document.model_space;
            document.definitions.insert(
                id,
                Definition {
                    id,
                    name: MODEL_SPACE.to_string(),
                    base_point: Point2::new(0.0, 0.0),
                    is_external: false,
                    is_overlay: false,
                    is_layout: true,
                    is_resolved: true,
                    source_path: None,
                    entities: Vec::new(),
                },
            );
        }
        document.ensure_layer("0");
        document
    }
}

fn normalize_angle(angle: f64) -> f64 {
    let mut result = angle % TAU;
    if result < 0.0 {
        result += TAU;
    }
    result
}

fn canonical_interval(start: f64, end: f64) -> (f64, f64) {
    let start = normalize_angle(start);
    let mut end = normalize_angle(end);
    if (end - start).abs() < 1e-9 {
        end = start + TAU;
    } else if end < start {
        end += TAU;
    }
    (start, end)
}

fn arc_point(center: Point2, radius: f64, angle: f64) -> Point2 {
    let offset = Vector2::new(radius * angle.cos(), radius * angle.sin());
    center.translate(offset)
}

fn arc_bounds(arc: &Arc, bounds: &mut Bounds2D) {
    let radius = arc.radius.abs();
    if radius <= f64::EPSILON {
        bounds.include_point(arc.center);
        return;
    }

    let (start, end) = canonical_interval(arc.start_angle, arc.end_angle);
    bounds.include_point(arc_point(arc.center, radius, start));
    bounds.include_point(arc_point(arc.center, radius, end));

    const QUADRANTS: [f64; 4] = [0.0, FRAC_PI_2, PI, FRAC_PI_2 * 3.0];
    for base in QUADRANTS {
        let mut candidate = base;
        while candidate < start {
            candidate += TAU;
        }
        if candidate <= end {
            bounds.include_point(arc_point(arc.center, radius, candidate));
        }
    }
}

fn polyline_segment_bounds(start: Point2, end: Point2, bulge: f64, bounds: &mut Bounds2D) {
    if bulge.abs() <= 1e-9 {
        return;
    }

    let start_vec = start.as_vec2();
    let end_vec = end.as_vec2();
    let chord = end_vec - start_vec;
    let chord_len = chord.length();
    if chord_len <= f64::EPSILON {
        return;
    }

    let theta = 4.0 * bulge.atan();
    let half_theta = theta / 2.0;
    let sin_half = half_theta.sin();
    if sin_half.abs() <= 1e-9 {
        return;
    }

    let radius = chord_len / (2.0 * sin_half);
    let midpoint = (start_vec + end_vec) * 0.5;
    let perp = DVec2::new(-chord.y, chord.x).normalize();
    // 圆心位于弦中点沿法向偏移 (r - 矢高) 处。
    let sagitta = bulge * chord_len / 2.0;
    let center_vec = midpoint + perp * (radius - sagitta);
    let center = Point2::from_vec(center_vec);

    let start_dir = start_vec - center_vec;
    let start_angle = start_dir.y.atan2(start_dir.x);
    let (from, to) = if theta >= 0.0 {
        (start_angle, start_angle + theta)
    } else {
        (start_angle + theta, start_angle)
    };

    let arc = Arc {
        center,
        radius: radius.abs(),
        start_angle: from,
        end_angle: to,
        layer: String::new(),
    };
    arc_bounds(&arc, bounds);
}

fn include_frame_bounds(
    bounds: &mut Bounds2D,
    insert: Point2,
    u_vector: Vector2,
    v_vector: Vector2,
    image_size: Vector2,
) {
    let origin = insert.as_vec2();
    let u = u_vector.as_vec2();
    let v = v_vector.as_vec2();
    let width = image_size.x();
    let height = image_size.y();
    for (x, y) in [(0.0, 0.0), (width, 0.0), (0.0, height), (width, height)] {
        bounds.include_point(Point2::from_vec(origin + u * x + v * y));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn document_stores_entities_in_model_space() {
        let mut doc = Document::new();
        let line = doc.add_line(Point2::new(0.0, 0.0), Point2::new(10.0, 0.0), "0");
        let circle = doc.add_circle(Point2::new(5.0, 5.0), 2.0, "ANNOT");
        let arc = doc.add_arc(Point2::new(5.0, 0.0), 3.5, 0.0, FRAC_PI_2, "GEOM");

        assert_eq!(line.get(), 0);
        assert_eq!(circle.get(), 1);
        assert_eq!(arc.get(), 2);
        let layers: Vec<_> = doc.layers().map(|l| l.name.clone()).collect();
        assert!(layers.contains(&"0".to_string()));
        assert!(layers.contains(&"ANNOT".to_string()));
        assert!(layers.contains(&"GEOM".to_string()));
        assert_eq!(doc.entities().count(), 3);

        match doc.entity(arc) {
            Some(Entity::Arc(arc)) => {
                assert_eq!(arc.layer, "GEOM");
                assert!((arc.radius - 3.5).abs() < f64::EPSILON);
            }
            other => panic!("unexpected entity lookup result: {other:?}"),
        }

        let bounds = doc.bounds().expect("document bounds should exist");
        assert!((bounds.min().x() - 0.0).abs() < 1e-9);
        assert!((bounds.min().y() - 0.0).abs() < 1e-9);
        assert!((bounds.max().x() - 10.0).abs() < 1e-9);
        assert!((bounds.max().y() - 7.0).abs() < 1e-9);
    }

    #[test]
    fn block_reference_bounds_follow_definition() {
        let mut doc = Document::new();
        let block = doc.add_definition("BOX", Point2::new(0.0, 0.0));
        doc.add_entity_to(
            block,
            polyline(
                [
                    Point2::new(0.0, 0.0),
                    Point2::new(2.0, 0.0),
                    Point2::new(2.0, 1.0),
                    Point2::new(0.0, 1.0),
                ],
                true,
                "0",
            ),
        )
        .unwrap();
        let reference = doc.add_block_reference(
            block,
            Point2::new(10.0, 10.0),
            Vector2::new(3.0, 3.0),
            0.0,
            "0",
        );

        let bounds = doc.entity_bounds(reference).expect("reference bounds");
        assert!((bounds.min().x() - 10.0).abs() < 1e-9);
        assert!((bounds.max().x() - 16.0).abs() < 1e-9);
        assert!((bounds.max().y() - 13.0).abs() < 1e-9);
    }

    #[test]
    fn unresolved_xref_and_unloaded_underlay_have_unknown_extents() {
        let mut doc = Document::new();
        let xref = doc.add_external_definition("SITE", "site.dwg", false, false);
        let reference =
            doc.add_block_reference(xref, Point2::new(0.0, 0.0), Vector2::new(1.0, 1.0), 0.0, "0");
        assert!(doc.entity_bounds(reference).is_none());

        let pdf = doc.add_resource("plan", ResourceKind::PdfUnderlay, "plan.pdf");
        let underlay = doc.add_entity(Entity::Underlay(Underlay {
            resource: pdf,
            insert: Point2::new(0.0, 0.0),
            scale: Vector2::new(1.0, 1.0),
            rotation: 0.0,
            extents: None,
            layer: "0".to_string(),
        }));
        assert!(doc.entity_bounds(underlay).is_none());
    }

    #[test]
    fn bulged_polyline_bounds_include_arc_extreme() {
        let mut doc = Document::new();
        // 半圆：从 (0,0) 到 (10,0)，凸度 1，圆弧位于弦下方。
        let id = doc.add_entity(Entity::Polyline(Polyline {
            vertices: vec![
                PolylineVertex::with_bulge(Point2::new(0.0, 0.0), 1.0),
                PolylineVertex::new(Point2::new(10.0, 0.0)),
            ],
            is_closed: false,
            layer: "0".to_string(),
        }));
        let bounds = doc.entity_bounds(id).expect("bounds");
        assert!((bounds.min().y() + 5.0).abs() < 1e-9);
        assert!(bounds.max().y().abs() < 1e-9);
    }

    #[test]
    fn circle_cannot_be_transformed_by_non_uniform_scale() {
        let circle = Entity::Circle(Circle {
            center: Point2::new(0.0, 0.0),
            radius: 1.0,
            layer: "0".to_string(),
        });
        let stretch = Transform2::new(
            Point2::new(0.0, 0.0),
            Point2::new(0.0, 0.0),
            Vector2::new(2.0, 1.0),
            0.0,
        );
        assert!(circle.transformed(&stretch).is_none());

        let line = Entity::Line(Line {
            start: Point2::new(0.0, 0.0),
            end: Point2::new(1.0, 1.0),
            layer: "0".to_string(),
        });
        match line.transformed(&stretch) {
            Some(Entity::Line(line)) => {
                assert!((line.end.x() - 2.0).abs() < 1e-9);
                assert!((line.end.y() - 1.0).abs() < 1e-9);
            }
            other => panic!("expected transformed line, got {other:?}"),
        }
    }

    #[test]
    fn json_round_trip_preserves_ids_and_counters() {
        let mut doc = Document::new();
        let image = doc.add_resource("logo", ResourceKind::RasterImage, "logo.png");
        doc.add_raster_image(image, Point2::new(0.0, 0.0), Vector2::new(4.0, 2.0), "IMG");
        let json = serde_json::to_string(&doc).expect("serialize");
        let mut restored: Document = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(restored.entities().count(), 1);
        assert_eq!(restored.resources().count(), 1);
        let next = restored.add_line(Point2::new(0.0, 0.0), Point2::new(1.0, 0.0), "0");
        assert_eq!(next.get(), 1);
    }
}
