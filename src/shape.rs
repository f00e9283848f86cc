use smallvec::SmallVec;
use std::mem::size_of;

pub type Dims = SmallVec<[i64; size_of::<usize>() * 4 / size_of::<i64>()]>;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ElementType {
    Pred,
    S8,
    S16,
    S32,
    S64,
    U8,
    U16,
    U32,
    U64,
    F16,
    BF16,
    F32,
    F64,
    C64,
    C128,
}

impl ElementType {
    pub fn byte_width(self) -> i64 {
        match self {
            ElementType::Pred | ElementType::S8 | ElementType::U8 => 1,
            ElementType::S16 | ElementType::U16 | ElementType::F16 | ElementType::BF16 => 2,
            ElementType::S32 | ElementType::U32 | ElementType::F32 => 4,
            ElementType::S64 | ElementType::U64 | ElementType::F64 | ElementType::C64 => 8,
            ElementType::C128 => 16,
        }
    }
}

pub const DEFAULT_MEMORY_SPACE: i64 = 0;

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Layout {
    pub minor_to_major: Dims,
    pub memory_space: i64,
}

impl Layout {
    /// The row-major layout for an array of the given rank.
    pub fn major_to_minor(rank: usize) -> Self {
        Layout {
            minor_to_major: (0..rank as i64).rev().collect(),
            memory_space: DEFAULT_MEMORY_SPACE,
        }
    }

    pub fn in_memory_space(self, memory_space: i64) -> Self {
        Layout {
            memory_space,
            ..self
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ArrayShape {
    pub element_type: ElementType,
    pub dims: Dims,
    pub layout: Option<Layout>,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Shape {
    Array(ArrayShape),
    Tuple(Vec<Shape>),
    Token,
}

impl Shape {
    /// An array shape with the default row-major layout.
    pub fn array(element_type: ElementType, dims: &[i64]) -> Self {
        Shape::Array(ArrayShape {
            element_type,
            dims: Dims::from_slice(dims),
            layout: Some(Layout::major_to_minor(dims.len())),
        })
    }

    /// An array shape that has not been assigned a layout yet.
    pub fn array_without_layout(element_type: ElementType, dims: &[i64]) -> Self {
        Shape::Array(ArrayShape {
            element_type,
            dims: Dims::from_slice(dims),
            layout: None,
        })
    }

    pub fn scalar(element_type: ElementType) -> Self {
        Shape::array(element_type, &[])
    }

    pub fn tuple(elements: impl IntoIterator<Item = Shape>) -> Self {
        Shape::Tuple(elements.into_iter().collect())
    }

    pub fn with_memory_space(self, memory_space: i64) -> Self {
        match self {
            Shape::Array(ArrayShape {
                element_type,
                dims,
                layout,
            }) => {
                let layout = layout
                    .unwrap_or_else(|| Layout::major_to_minor(dims.len()))
                    .in_memory_space(memory_space);
                Shape::Array(ArrayShape {
                    element_type,
                    dims,
                    layout: Some(layout),
                })
            }
            other => other,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Shape::Array(_))
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Shape::Tuple(_))
    }

    pub fn dims(&self) -> &[i64] {
        match self {
            Shape::Array(array) => &array.dims,
            _ => &[],
        }
    }

    pub fn rank(&self) -> usize {
        self.dims().len()
    }

    pub fn dim(&self, dim: usize) -> Option<i64> {
        self.dims().get(dim).copied()
    }

    /// Number of elements in an array shape, or `None` if it does not fit in an `i64`. Tuples and
    /// tokens have none of their own.
    pub fn checked_element_count(&self) -> Option<i64> {
        match self {
            Shape::Array(array) => array
                .dims
                .iter()
                .try_fold(1i64, |count, &dim| count.checked_mul(dim)),
            _ => Some(0),
        }
    }

    /// Like `checked_element_count`, but saturating at `i64::MAX`.
    pub fn element_count(&self) -> i64 {
        self.checked_element_count().unwrap_or(i64::MAX)
    }

    pub fn has_layout(&self) -> bool {
        match self {
            Shape::Array(array) => array.layout.is_some(),
            Shape::Tuple(elements) => elements.iter().all(Shape::has_layout),
            Shape::Token => true,
        }
    }

    pub fn memory_space(&self) -> Option<i64> {
        match self {
            Shape::Array(ArrayShape {
                layout: Some(layout),
                ..
            }) => Some(layout.memory_space),
            _ => None,
        }
    }

    pub fn tuple_element(&self, index: usize) -> Option<&Shape> {
        match self {
            Shape::Tuple(elements) => elements.get(index),
            _ => None,
        }
    }

    pub fn subshape(&self, index: &ShapeIndex) -> Option<&Shape> {
        index
            .iter()
            .try_fold(self, |shape, &i| shape.tuple_element(i))
    }

    /// Every array shape nested in this one, paired with its position. A non-tuple shape is its
    /// own single leaf at the empty index.
    pub fn leaf_shapes(&self) -> Vec<(ShapeIndex, &Shape)> {
        fn walk<'a>(
            shape: &'a Shape,
            index: &mut ShapeIndex,
            out: &mut Vec<(ShapeIndex, &'a Shape)>,
        ) {
            match shape {
                Shape::Tuple(elements) => {
                    for (i, element) in elements.iter().enumerate() {
                        index.0.push(i);
                        walk(element, index, out);
                        index.0.pop();
                    }
                }
                _ => out.push((index.clone(), shape)),
            }
        }

        let mut out = Vec::new();
        walk(self, &mut ShapeIndex::default(), &mut out);
        out
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Shape::Array(array) => {
                write!(f, "{:?}[", array.element_type)?;
                for (i, dim) in array.dims.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", dim)?;
                }
                f.write_str("]")
            }
            Shape::Tuple(elements) => {
                f.write_str("(")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", element)?;
                }
                f.write_str(")")
            }
            Shape::Token => f.write_str("token[]"),
        }
    }
}

/// Position of a subshape within a (possibly nested) tuple shape.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ShapeIndex(SmallVec<[usize; 2]>);

impl ShapeIndex {
    pub fn new(indices: &[usize]) -> Self {
        ShapeIndex(SmallVec::from_slice(indices))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &usize> {
        self.0.iter()
    }
}

impl std::fmt::Display for ShapeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("{")?;
        for (i, idx) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", idx)?;
        }
        f.write_str("}")
    }
}

pub type ShapeSizeFn = std::sync::Arc<dyn Fn(&Shape) -> i64 + Send + Sync>;

/// Size in bytes of the top-level buffer of a shape when stored densely: arrays hold their
/// elements, tuples hold a table of pointers to their elements, and tokens occupy nothing.
pub fn dense_byte_size(shape: &Shape, pointer_size: i64) -> i64 {
    match shape {
        Shape::Array(array) => array
            .element_type
            .byte_width()
            .saturating_mul(shape.element_count()),
        Shape::Tuple(elements) => pointer_size * elements.len() as i64,
        Shape::Token => 0,
    }
}

pub fn byte_size_fn(pointer_size: i64) -> ShapeSizeFn {
    std::sync::Arc::new(move |shape| dense_byte_size(shape, pointer_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_sizes() {
        let f32s = Shape::array(ElementType::F32, &[2, 3]);
        assert_eq!(dense_byte_size(&f32s, 8), 24);
        let pair = Shape::tuple([f32s.clone(), Shape::scalar(ElementType::S8)]);
        assert_eq!(dense_byte_size(&pair, 8), 16);
        assert_eq!(dense_byte_size(&Shape::Token, 8), 0);
    }

    #[test]
    fn huge_shapes_do_not_wrap() {
        let huge = Shape::array(ElementType::F32, &[1 << 32, 1 << 32]);
        assert_eq!(huge.checked_element_count(), None);
        assert_eq!(huge.element_count(), i64::MAX);
        assert_eq!(dense_byte_size(&huge, 8), i64::MAX);
        let big = Shape::array(ElementType::F32, &[1 << 30, 4]);
        assert_eq!(big.checked_element_count(), Some(1 << 32));
    }

    #[test]
    fn leaves_of_nested_tuple() {
        let inner = Shape::tuple([
            Shape::scalar(ElementType::F32),
            Shape::array(ElementType::S32, &[4]),
        ]);
        let outer = Shape::tuple([Shape::array(ElementType::F16, &[2]), inner]);
        let leaves: Vec<String> = outer
            .leaf_shapes()
            .into_iter()
            .map(|(index, shape)| format!("{} {}", index, shape))
            .collect();
        assert_eq!(leaves, ["{0} F16[2]", "{1,0} F32[]", "{1,1} S32[4]"]);
        assert_eq!(
            outer.subshape(&ShapeIndex::new(&[1, 1])),
            Some(&Shape::array(ElementType::S32, &[4]))
        );
        assert_eq!(outer.subshape(&ShapeIndex::new(&[0, 0])), None);
    }

    #[test]
    fn layouts() {
        assert!(Shape::array(ElementType::F32, &[3]).has_layout());
        let bare = Shape::array_without_layout(ElementType::F32, &[3]);
        assert!(!bare.has_layout());
        assert!(!Shape::tuple([bare.clone()]).has_layout());
        assert_eq!(bare.with_memory_space(1).memory_space(), Some(1));
    }
}
