pub mod document;
pub mod graph;

pub mod errors {
    use thiserror::Error;

    /// 图形数据库操作失败的原因。调用方按资源逐个捕获，不应中断整个阶段。
    #[derive(Debug, Clone, PartialEq, Error)]
    pub enum DocumentError {
        #[error("entity with id {0} not found")]
        EntityNotFound(u64),
        #[error("entity {0} is already erased")]
        EntityErased(u64),
        #[error("definition with id {0} not found")]
        DefinitionNotFound(u64),
        #[error("resource with id {0} not found")]
        ResourceNotFound(u64),
        #[error("resource {0} is already erased")]
        ResourceErased(u64),
        #[error("layer `{0}` not found")]
        LayerNotFound(String),
        #[error("layer `{0}` is locked")]
        LayerLocked(String),
        #[error("entity {0} cannot be exploded")]
        NotExplodable(u64),
        #[error("definition {0} is not external")]
        NotExternal(u64),
        #[error("definition {0} is a layout and cannot be removed")]
        LayoutDefinition(u64),
        #[error("definition {id} is still referenced by {references} reference(s)")]
        DefinitionInUse { id: u64, references: usize },
        #[error("resource {id} is still referenced by {references} entity(ies)")]
        ResourceInUse { id: u64, references: usize },
        #[error("dictionary entry {dictionary}/{entry} not found")]
        DictionaryEntryNotFound { dictionary: String, entry: String },
    }
}

pub mod geometry {
    use glam::DVec2;
    use serde::{Deserialize, Serialize};

    /// 低于该宽/高的矩形视为退化。
    pub const DEGENERATE_EPSILON: f64 = 1e-6;

    /// 二维点，内部以 `glam::DVec2` 表示。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Point2(pub DVec2);

    impl Point2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        #[inline]
        pub fn from_vec(vec: DVec2) -> Self {
            Self(vec)
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }

        #[inline]
        pub fn translate(self, offset: Vector2) -> Self {
            Self(self.0 + offset.0)
        }

        #[inline]
        pub fn vector_to(self, other: Point2) -> Vector2 {
            Vector2(other.0 - self.0)
        }

        #[inline]
        pub fn distance(self, other: Point2) -> f64 {
            self.0.distance(other.0)
        }

        #[inline]
        pub fn as_vec2(self) -> DVec2 {
            self.0
        }
    }

    impl From<DVec2> for Point2 {
        fn from(value: DVec2) -> Self {
            Self::from_vec(value)
        }
    }

    /// 二维向量。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Vector2(pub DVec2);

    impl Vector2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        #[inline]
        pub fn from_points(start: Point2, end: Point2) -> Self {
            Self(end.0 - start.0)
        }

        #[inline]
        pub fn length(self) -> f64 {
            self.0.length()
        }

        #[inline]
        pub fn length_squared(self) -> f64 {
            self.0.length_squared()
        }

        #[inline]
        pub fn dot(self, other: Vector2) -> f64 {
            self.0.dot(other.0)
        }

        #[inline]
        pub fn as_vec2(self) -> DVec2 {
            self.0
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }
    }

    impl From<DVec2> for Vector2 {
        fn from(value: DVec2) -> Self {
            Self(value)
        }
    }

    /// 轴对齐边界框，用于估算实体范围与区域判定。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Bounds2D {
        min: Point2,
        max: Point2,
    }

    impl Bounds2D {
        #[inline]
        pub fn new(min: Point2, max: Point2) -> Self {
            Self { min, max }
        }

        /// 由任意两个对角点构造，自动整理最小/最大坐标。
        pub fn from_corners(a: Point2, b: Point2) -> Self {
            let mut bounds = Self::empty();
            bounds.include_point(a);
            bounds.include_point(b);
            bounds
        }

        #[inline]
        pub fn empty() -> Self {
            Self {
                min: Point2::new(f64::INFINITY, f64::INFINITY),
                max: Point2::new(f64::NEG_INFINITY, f64::NEG_INFINITY),
            }
        }

        #[inline]
        pub fn is_empty(&self) -> bool {
            self.min.x() > self.max.x() || self.min.y() > self.max.y()
        }

        #[inline]
        pub fn min(&self) -> Point2 {
            self.min
        }

        #[inline]
        pub fn max(&self) -> Point2 {
            self.max
        }

        #[inline]
        pub fn width(&self) -> f64 {
            if self.is_empty() {
                0.0
            } else {
                self.max.x() - self.min.x()
            }
        }

        #[inline]
        pub fn height(&self) -> f64 {
            if self.is_empty() {
                0.0
            } else {
                self.max.y() - self.min.y()
            }
        }

        pub fn include_point(&mut self, point: Point2) {
            if self.is_empty() {
                self.min = point;
                self.max = point;
                return;
            }
            let min_vec = self.min.as_vec2().min(point.as_vec2());
            let max_vec = self.max.as_vec2().max(point.as_vec2());
            self.min = Point2::from_vec(min_vec);
            self.max = Point2::from_vec(max_vec);
        }

        pub fn include_bounds(&mut self, other: &Bounds2D) {
            if other.is_empty() {
                return;
            }
            self.include_point(other.min);
            self.include_point(other.max);
        }

        #[inline]
        pub fn center(&self) -> Point2 {
            debug_assert!(!self.is_empty());
            let center = (self.min.as_vec2() + self.max.as_vec2()) * 0.5;
            Point2::from_vec(center)
        }

        /// 点是否位于框内，边界点视为在内。
        pub fn contains_point(&self, point: Point2, tolerance: f64) -> bool {
            !self.is_empty()
                && point.x() >= self.min.x() - tolerance
                && point.x() <= self.max.x() + tolerance
                && point.y() >= self.min.y() - tolerance
                && point.y() <= self.max.y() + tolerance
        }

        /// 向四周分别扩展 `dx` / `dy`。
        pub fn expanded(&self, dx: f64, dy: f64) -> Bounds2D {
            if self.is_empty() {
                return *self;
            }
            Bounds2D::new(
                Point2::new(self.min.x() - dx, self.min.y() - dy),
                Point2::new(self.max.x() + dx, self.max.y() + dy),
            )
        }
    }

    /// 合并所有非空边界框；输入为空（或全为空框）时返回 `None`。
    pub fn union<I>(boxes: I) -> Option<Bounds2D>
    where
        I: IntoIterator<Item = Bounds2D>,
    {
        let mut bounds = Bounds2D::empty();
        let mut has = false;
        for item in boxes {
            if item.is_empty() {
                continue;
            }
            bounds.include_bounds(&item);
            has = true;
        }
        if has { Some(bounds) } else { None }
    }

    /// 仅比较 XY 平面的 AABB 重叠。`include_touch` 为真时边相接也算重叠，
    /// `tolerance` 用于吸收浮点误差。
    pub fn intersects_xy(a: &Bounds2D, b: &Bounds2D, include_touch: bool, tolerance: f64) -> bool {
        if a.is_empty() || b.is_empty() {
            return false;
        }
        let tolerance = tolerance.abs();
        if include_touch {
            a.min().x() <= b.max().x() + tolerance
                && b.min().x() <= a.max().x() + tolerance
                && a.min().y() <= b.max().y() + tolerance
                && b.min().y() <= a.max().y() + tolerance
        } else {
            a.min().x() < b.max().x() - tolerance
                && b.min().x() < a.max().x() - tolerance
                && a.min().y() < b.max().y() - tolerance
                && b.min().y() < a.max().y() - tolerance
        }
    }

    /// 由边界框还原逆时针四角点（左下起）；宽或高退化时返回 `None`。
    pub fn rectangle_from_box(bounds: &Bounds2D) -> Option<[Point2; 4]> {
        if bounds.is_empty()
            || bounds.width() < DEGENERATE_EPSILON
            || bounds.height() < DEGENERATE_EPSILON
        {
            return None;
        }
        let min = bounds.min();
        let max = bounds.max();
        Some([
            min,
            Point2::new(max.x(), min.y()),
            max,
            Point2::new(min.x(), max.y()),
        ])
    }

    /// 块参照的插入变换：先减基点，再缩放、旋转，最后平移到插入点。
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct Transform2 {
        pub base_point: Point2,
        pub insert: Point2,
        pub scale: Vector2,
        pub rotation: f64,
    }

    impl Transform2 {
        pub fn new(base_point: Point2, insert: Point2, scale: Vector2, rotation: f64) -> Self {
            Self {
                base_point,
                insert,
                scale,
                rotation,
            }
        }

        #[inline]
        pub fn is_uniform(&self) -> bool {
            (self.scale.x().abs() - self.scale.y().abs()).abs() <= 1e-9
        }

        /// 是否包含镜像（行列式为负）。
        #[inline]
        pub fn is_mirrored(&self) -> bool {
            self.scale.x() * self.scale.y() < 0.0
        }

        pub fn apply_vector(&self, vector: Vector2) -> Vector2 {
            let scaled = vector.as_vec2() * self.scale.as_vec2();
            Vector2(DVec2::from_angle(self.rotation).rotate(scaled))
        }

        pub fn apply(&self, point: Point2) -> Point2 {
            let local = Vector2(point.as_vec2() - self.base_point.as_vec2());
            self.insert.translate(self.apply_vector(local))
        }
    }

}
