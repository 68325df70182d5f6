//! 图框候选识别：三种策略各自产生候选矩形，按规则表打分后取最高分。

use std::collections::BTreeSet;
use std::fmt;

use cadclean_core::document::{DefinitionId, Entity, EntityId, Polyline};
use cadclean_core::geometry::{self, Bounds2D, Point2, Vector2};
use cadclean_core::graph::SceneGraph;
use tracing::{debug, info};

/// 区域与锚点判定使用的容差。
pub const REGION_TOLERANCE: f64 = 1e-6;
/// 策略 B 判定水平/竖直线段的容差。
const AXIS_TOLERANCE: f64 = 0.01;
/// 策略 B 的边缘容差系数，乘以整体范围较短边。
const SIDE_TOLERANCE_FACTOR: f64 = 0.025;
const NEAR_ORIGIN_DISTANCE: f64 = 5.0;
const SHORT_SHEET_SIDE: (f64, f64) = (27.0, 33.0);
const LONG_SHEET_SIDE: (f64, f64) = (37.8, 46.2);
/// 标准图幅长短边比例区间。
const SHEET_RATIO_BANDS: [(f64, f64); 3] = [(1.30, 1.36), (1.38, 1.45), (1.48, 1.56)];
const CLUSTER_PADDING_RATIO: f64 = 0.25;
const CLUSTER_MIN_PADDING: f64 = 1.0;
const MIN_CLUSTER_ANCHORS: usize = 3;

pub const DEFAULT_LAYER_KEYWORDS: &[&str] = &["TITLE", "TBLK", "TTLB", "BORDER", "SHEET", "FRAME"];
pub const DEFAULT_FIELD_TAGS: &[&str] = &[
    "SHEETNO",
    "SHEETNUMBER",
    "SHEET",
    "DRAWNBY",
    "DRAWN",
    "CHECKEDBY",
    "CHECKED",
    "SCALE",
    "REV",
    "REVISION",
    "DATE",
    "TITLE",
    "SHEETTITLE",
    "PROJECT",
    "PROJECTNO",
    "JOBNO",
    "DWGNO",
    "DRAWINGNO",
    "DRAWINGNUMBER",
    "APPROVEDBY",
];

/// 识别参数：图层关键词与图框字段标签词表。
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    pub layer_keywords: Vec<String>,
    pub field_tags: Vec<String>,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            layer_keywords: DEFAULT_LAYER_KEYWORDS.iter().map(|s| s.to_string()).collect(),
            field_tags: DEFAULT_FIELD_TAGS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl DetectorSettings {
    /// 图层名（不区分大小写）包含任一关键词。
    pub fn is_title_layer(&self, layer: &str) -> bool {
        let upper = layer.to_uppercase();
        self.layer_keywords
            .iter()
            .any(|keyword| !keyword.is_empty() && upper.contains(&keyword.to_uppercase()))
    }

    /// 标签归一化（大写、仅保留字母数字）后命中词表。
    pub fn is_field_tag(&self, tag: &str) -> bool {
        let normalized = normalize_tag(tag);
        !normalized.is_empty()
            && self
                .field_tags
                .iter()
                .any(|known| normalize_tag(known) == normalized)
    }
}

fn normalize_tag(tag: &str) -> String {
    tag.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_uppercase)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Strategy {
    ClosedQuad,
    OrthogonalFrame,
    AnchorCluster,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::ClosedQuad => "closed-quad",
            Strategy::OrthogonalFrame => "orthogonal-frame",
            Strategy::AnchorCluster => "anchor-cluster",
        };
        f.write_str(name)
    }
}

/// 带标签的属性定义插入点，作为图框识别的佐证。
#[derive(Debug, Clone, PartialEq)]
pub struct Anchor {
    pub id: EntityId,
    pub tag: String,
    pub position: Point2,
}

/// 打分时可观察到的证据。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evidence {
    Always,
    TitleLayer,
    SheetRatio,
    ArchitecturalSheet,
    NearOrigin,
    AnchorsInside,
    RecognizedTags,
}

/// 一条打分规则：证据计数乘以权重，可选上限。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreRule {
    pub name: &'static str,
    pub evidence: Evidence,
    pub weight: f64,
    pub cap: Option<f64>,
}

const TITLE_LAYER_RULE: ScoreRule = ScoreRule {
    name: "title-layer",
    evidence: Evidence::TitleLayer,
    weight: 0.8,
    cap: None,
};
const ANCHORS_RULE: ScoreRule = ScoreRule {
    name: "anchors-inside",
    evidence: Evidence::AnchorsInside,
    weight: 0.3,
    cap: Some(2.0),
};
const TAGS_RULE: ScoreRule = ScoreRule {
    name: "recognized-tags",
    evidence: Evidence::RecognizedTags,
    weight: 0.5,
    cap: Some(2.0),
};

pub const CLOSED_QUAD_RULES: &[ScoreRule] = &[
    ScoreRule {
        name: "closed-quad",
        evidence: Evidence::Always,
        weight: 0.7,
        cap: None,
    },
    TITLE_LAYER_RULE,
    ScoreRule {
        name: "sheet-ratio",
        evidence: Evidence::SheetRatio,
        weight: 3.0,
        cap: None,
    },
    ANCHORS_RULE,
    TAGS_RULE,
];

pub const ORTHOGONAL_FRAME_RULES: &[ScoreRule] = &[
    ScoreRule {
        name: "orthogonal-frame",
        evidence: Evidence::Always,
        weight: 5.0,
        cap: None,
    },
    ScoreRule {
        name: "architectural-sheet",
        evidence: Evidence::ArchitecturalSheet,
        weight: 4.0,
        cap: None,
    },
    ScoreRule {
        name: "near-origin",
        evidence: Evidence::NearOrigin,
        weight: 2.0,
        cap: None,
    },
    TITLE_LAYER_RULE,
    ANCHORS_RULE,
    TAGS_RULE,
];

/// 兜底候选固定得分，低于 A/B 策略可能取得的任何分数。
pub const ANCHOR_CLUSTER_RULES: &[ScoreRule] = &[ScoreRule {
    name: "anchor-cluster",
    evidence: Evidence::Always,
    weight: 2.9,
    cap: None,
}];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Features {
    title_layer: bool,
    sheet_ratio: bool,
    architectural_sheet: bool,
    near_origin: bool,
    anchors_inside: usize,
    recognized_tags: usize,
}

impl Features {
    fn count(&self, evidence: Evidence) -> usize {
        match evidence {
            Evidence::Always => 1,
            Evidence::TitleLayer => usize::from(self.title_layer),
            Evidence::SheetRatio => usize::from(self.sheet_ratio),
            Evidence::ArchitecturalSheet => usize::from(self.architectural_sheet),
            Evidence::NearOrigin => usize::from(self.near_origin),
            Evidence::AnchorsInside => self.anchors_inside,
            Evidence::RecognizedTags => self.recognized_tags,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FiredRule {
    pub name: &'static str,
    pub points: f64,
}

/// 打分明细：命中的规则及总分。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreCard {
    pub fired: Vec<FiredRule>,
    pub total: f64,
}

impl ScoreCard {
    pub fn has(&self, name: &str) -> bool {
        self.fired.iter().any(|rule| rule.name == name)
    }
}

fn score(rules: &[ScoreRule], features: &Features) -> ScoreCard {
    let mut card = ScoreCard::default();
    for rule in rules {
        let count = features.count(rule.evidence);
        if count == 0 {
            continue;
        }
        let raw = rule.weight * count as f64;
        let points = rule.cap.map_or(raw, |cap| raw.min(cap));
        card.total += points;
        card.fired.push(FiredRule {
            name: rule.name,
            points,
        });
    }
    card
}

/// 识别出的图框区域。
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub corners: [Point2; 4],
    pub strategy: Strategy,
    pub score: f64,
    /// 构成该候选的实体。
    pub boundary: BTreeSet<EntityId>,
    pub card: ScoreCard,
}

impl Candidate {
    pub fn bounds(&self) -> Bounds2D {
        let mut bounds = Bounds2D::empty();
        for corner in self.corners {
            bounds.include_point(corner);
        }
        bounds
    }
}

/// 收集容器中所有未删除的属性定义作为锚点。
pub fn collect_anchors<G>(graph: &G, container: DefinitionId) -> Vec<Anchor>
where
    G: SceneGraph + ?Sized,
{
    graph
        .entity_ids(container)
        .into_iter()
        .filter_map(|id| match graph.entity(id) {
            Some(Entity::AttributeDefinition(attdef)) => Some(Anchor {
                id,
                tag: attdef.tag.clone(),
                position: attdef.insert,
            }),
            _ => None,
        })
        .collect()
}

/// 在已扁平化的容器中识别图框，返回得分最高的候选。
///
/// 同分时按策略顺序 A、B、C 取胜。
pub fn detect_title_block<G>(
    graph: &G,
    container: DefinitionId,
    settings: &DetectorSettings,
) -> Option<Candidate>
where
    G: SceneGraph + ?Sized,
{
    let anchors = collect_anchors(graph, container);
    let mut candidates = closed_quad_candidates(graph, container, &anchors, settings);
    candidates.extend(orthogonal_frame_candidate(graph, container, &anchors, settings));
    if candidates.is_empty() {
        candidates.extend(anchor_cluster_candidate(&anchors));
    }
    debug!(
        container = container.get(),
        anchors = anchors.len(),
        candidates = candidates.len(),
        "图框候选收集完成"
    );

    let best = select_best(candidates);
    match &best {
        Some(candidate) => info!(
            strategy = %candidate.strategy,
            score = candidate.score,
            min_x = candidate.corners[0].x(),
            min_y = candidate.corners[0].y(),
            "识别到图框"
        ),
        None => debug!(container = container.get(), "未识别到图框"),
    }
    best
}

/// 取得分最高的候选；同分时策略顺序靠前者（A、B、C）胜出，再同则保留先出现者。
fn select_best(candidates: Vec<Candidate>) -> Option<Candidate> {
    let mut best: Option<Candidate> = None;
    for candidate in candidates {
        let better = best.as_ref().is_none_or(|current| {
            candidate.score > current.score
                || (candidate.score == current.score && candidate.strategy < current.strategy)
        });
        if better {
            best = Some(candidate);
        }
    }
    best
}

/// 范围与候选框相交（含相接）的实体；无法计算范围的实体不属于该区域。
pub fn region_members<G>(graph: &G, container: DefinitionId, region: &Bounds2D) -> BTreeSet<EntityId>
where
    G: SceneGraph + ?Sized,
{
    graph
        .entity_ids(container)
        .into_iter()
        .filter(|id| {
            graph
                .bounding_box(*id)
                .is_some_and(|bounds| geometry::intersects_xy(&bounds, region, true, REGION_TOLERANCE))
        })
        .collect()
}

fn anchor_features(anchors: &[Anchor], bounds: &Bounds2D, settings: &DetectorSettings) -> (usize, usize) {
    let inside: Vec<&Anchor> = anchors
        .iter()
        .filter(|anchor| bounds.contains_point(anchor.position, REGION_TOLERANCE))
        .collect();
    let recognized = inside
        .iter()
        .filter(|anchor| settings.is_field_tag(&anchor.tag))
        .count();
    (inside.len(), recognized)
}

fn in_ratio_band(width: f64, height: f64) -> bool {
    let long = width.max(height);
    let short = width.min(height);
    if short < geometry::DEGENERATE_EPSILON {
        return false;
    }
    let ratio = long / short;
    SHEET_RATIO_BANDS
        .iter()
        .any(|(low, high)| ratio >= *low && ratio <= *high)
}

fn in_range(value: f64, (low, high): (f64, f64)) -> bool {
    value >= low && value <= high
}

fn is_architectural_sheet(width: f64, height: f64) -> bool {
    (in_range(width, SHORT_SHEET_SIDE) && in_range(height, LONG_SHEET_SIDE))
        || (in_range(width, LONG_SHEET_SIDE) && in_range(height, SHORT_SHEET_SIDE))
}

/// 策略 A：闭合的四顶点矩形多段线。
fn closed_quad_candidates<G>(
    graph: &G,
    container: DefinitionId,
    anchors: &[Anchor],
    settings: &DetectorSettings,
) -> Vec<Candidate>
where
    G: SceneGraph + ?Sized,
{
    let mut candidates = Vec::new();
    for id in graph.entity_ids(container) {
        let Some(Entity::Polyline(polyline)) = graph.entity(id) else {
            continue;
        };
        let Some(corners) = rectangle_corners(polyline) else {
            continue;
        };
        let mut bounds = Bounds2D::empty();
        for corner in corners {
            bounds.include_point(corner);
        }
        let (anchors_inside, recognized_tags) = anchor_features(anchors, &bounds, settings);
        let side_a = corners[0].distance(corners[1]);
        let side_b = corners[1].distance(corners[2]);
        let features = Features {
            title_layer: settings.is_title_layer(&polyline.layer),
            sheet_ratio: in_ratio_band(side_a, side_b),
            anchors_inside,
            recognized_tags,
            ..Features::default()
        };
        let card = score(CLOSED_QUAD_RULES, &features);
        debug!(entity = id.get(), score = card.total, "闭合矩形候选");
        candidates.push(Candidate {
            corners,
            strategy: Strategy::ClosedQuad,
            score: card.total,
            boundary: BTreeSet::from([id]),
            card,
        });
    }
    candidates
}

/// 闭合、无凸度、四个不同顶点且对边等长、邻边垂直时返回顶点。
fn rectangle_corners(polyline: &Polyline) -> Option<[Point2; 4]> {
    if !polyline.is_closed {
        return None;
    }
    if polyline.vertices.iter().any(|vertex| vertex.bulge.abs() > 1e-9) {
        return None;
    }
    let mut points: Vec<Point2> = polyline.vertices.iter().map(|vertex| vertex.position).collect();
    if points.len() == 5 && points[0].distance(points[4]) < geometry::DEGENERATE_EPSILON {
        points.pop();
    }
    let corners: [Point2; 4] = points.try_into().ok()?;

    let edges: Vec<Vector2> = (0..4)
        .map(|index| corners[index].vector_to(corners[(index + 1) % 4]))
        .collect();
    let lengths: Vec<f64> = edges.iter().map(|edge| edge.length()).collect();
    if lengths.iter().any(|length| *length < geometry::DEGENERATE_EPSILON) {
        return None;
    }
    let same = |a: f64, b: f64| (a - b).abs() <= 0.01 * a.max(b);
    if !same(lengths[0], lengths[2]) || !same(lengths[1], lengths[3]) {
        return None;
    }
    for index in 0..4 {
        let next = (index + 1) % 4;
        let cos = edges[index].dot(edges[next]) / (lengths[index] * lengths[next]);
        if cos.abs() > 0.01 {
            return None;
        }
    }
    Some(corners)
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    owner: EntityId,
    start: Point2,
    end: Point2,
}

impl Segment {
    fn midpoint(&self) -> Point2 {
        Point2::from_vec((self.start.as_vec2() + self.end.as_vec2()) * 0.5)
    }

    fn is_horizontal(&self) -> bool {
        (self.end.y() - self.start.y()).abs() <= AXIS_TOLERANCE
            && (self.end.x() - self.start.x()).abs() > AXIS_TOLERANCE
    }

    fn is_vertical(&self) -> bool {
        (self.end.x() - self.start.x()).abs() <= AXIS_TOLERANCE
            && (self.end.y() - self.start.y()).abs() > AXIS_TOLERANCE
    }
}

fn straight_segments(id: EntityId, entity: &Entity) -> Vec<Segment> {
    match entity {
        Entity::Line(line) => vec![Segment {
            owner: id,
            start: line.start,
            end: line.end,
        }],
        Entity::Polyline(polyline) => {
            let count = polyline.vertices.len();
            let mut segments = Vec::new();
            for (index, vertex) in polyline.vertices.iter().enumerate() {
                let next = if index + 1 < count {
                    &polyline.vertices[index + 1]
                } else if polyline.is_closed && count > 2 {
                    &polyline.vertices[0]
                } else {
                    continue;
                };
                if vertex.bulge.abs() > 1e-9 {
                    continue;
                }
                segments.push(Segment {
                    owner: id,
                    start: vertex.position,
                    end: next.position,
                });
            }
            segments
        }
        _ => Vec::new(),
    }
}

/// 策略 B：由贴近整体范围四边的水平/竖直线段重建图框。
fn orthogonal_frame_candidate<G>(
    graph: &G,
    container: DefinitionId,
    anchors: &[Anchor],
    settings: &DetectorSettings,
) -> Option<Candidate>
where
    G: SceneGraph + ?Sized,
{
    let ids = graph.entity_ids(container);
    let extents = geometry::union(ids.iter().filter_map(|id| graph.bounding_box(*id)))?;
    let tolerance = SIDE_TOLERANCE_FACTOR * extents.width().min(extents.height());

    let segments: Vec<Segment> = ids
        .iter()
        .filter_map(|id| graph.entity(*id).map(|entity| straight_segments(*id, entity)))
        .flatten()
        .collect();

    let mut bottom = Vec::new();
    let mut top = Vec::new();
    let mut left = Vec::new();
    let mut right = Vec::new();
    for segment in &segments {
        let mid = segment.midpoint();
        if segment.is_horizontal() {
            if (mid.y() - extents.min().y()).abs() <= tolerance {
                bottom.push(*segment);
            } else if (mid.y() - extents.max().y()).abs() <= tolerance {
                top.push(*segment);
            }
        } else if segment.is_vertical() {
            if (mid.x() - extents.min().x()).abs() <= tolerance {
                left.push(*segment);
            } else if (mid.x() - extents.max().x()).abs() <= tolerance {
                right.push(*segment);
            }
        }
    }
    if bottom.is_empty() || top.is_empty() || left.is_empty() || right.is_empty() {
        return None;
    }

    let average = |side: &[Segment], pick: fn(Point2) -> f64| {
        side.iter().map(|segment| pick(segment.midpoint())).sum::<f64>() / side.len() as f64
    };
    let frame = Bounds2D::from_corners(
        Point2::new(average(&left, Point2::x), average(&bottom, Point2::y)),
        Point2::new(average(&right, Point2::x), average(&top, Point2::y)),
    );
    let corners = geometry::rectangle_from_box(&frame)?;

    let boundary: BTreeSet<EntityId> = [&bottom, &top, &left, &right]
        .into_iter()
        .flatten()
        .map(|segment| segment.owner)
        .collect();
    let title_layer = boundary.iter().any(|id| {
        graph
            .entity(*id)
            .is_some_and(|entity| settings.is_title_layer(entity.layer_name()))
    });
    let origin = Point2::new(0.0, 0.0);
    let (anchors_inside, recognized_tags) = anchor_features(anchors, &frame, settings);
    let features = Features {
        title_layer,
        architectural_sheet: is_architectural_sheet(frame.width(), frame.height()),
        near_origin: corners
            .iter()
            .any(|corner| corner.distance(origin) <= NEAR_ORIGIN_DISTANCE),
        anchors_inside,
        recognized_tags,
        ..Features::default()
    };
    let card = score(ORTHOGONAL_FRAME_RULES, &features);
    debug!(segments = boundary.len(), score = card.total, "正交图框候选");
    Some(Candidate {
        corners,
        strategy: Strategy::OrthogonalFrame,
        score: card.total,
        boundary,
        card,
    })
}

/// 策略 C：锚点聚集范围外扩后作为兜底候选。
fn anchor_cluster_candidate(anchors: &[Anchor]) -> Option<Candidate> {
    if anchors.len() < MIN_CLUSTER_ANCHORS {
        return None;
    }
    let mut cluster = Bounds2D::empty();
    for anchor in anchors {
        cluster.include_point(anchor.position);
    }
    let pad_x = (cluster.width() * CLUSTER_PADDING_RATIO).max(CLUSTER_MIN_PADDING);
    let pad_y = (cluster.height() * CLUSTER_PADDING_RATIO).max(CLUSTER_MIN_PADDING);
    let padded = cluster.expanded(pad_x, pad_y);
    let corners = geometry::rectangle_from_box(&padded)?;
    let card = score(ANCHOR_CLUSTER_RULES, &Features::default());
    debug!(anchors = anchors.len(), "锚点聚集兜底候选");
    Some(Candidate {
        corners,
        strategy: Strategy::AnchorCluster,
        score: card.total,
        boundary: anchors.iter().map(|anchor| anchor.id).collect(),
        card,
    })
}
