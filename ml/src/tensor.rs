//! Dense three-dimensional activation blocks.
//!
//! A [`Tensor`] stores `width x height x depth` activations in position-major layout
//! (`[x][y][z]`, depth innermost), so the flattened form of a window is the order in which
//! units read their input. Next to the values every tensor carries an overlap counter per
//! cell, used to average reconstructions of overlapping tiles.
use crate::ImagePrecision;
use ndarray::*;

/// Spatial extent of a unit's input window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatchShape {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl PatchShape {
    pub fn new(width: usize, height: usize, depth: usize) -> PatchShape {
        PatchShape {
            width,
            height,
            depth,
        }
    }

    /// Number of scalars in a window of this shape.
    pub fn len(&self) -> usize {
        self.width * self.height * self.depth
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    values: Array3<ImagePrecision>,
    /// Number of tiles that wrote into each cell since the last clear
    weights: Array3<ImagePrecision>,
}

impl Tensor {
    pub fn new(width: usize, height: usize, depth: usize) -> Tensor {
        Tensor {
            values: Array::zeros((width, height, depth)),
            weights: Array::zeros((width, height, depth)),
        }
    }

    /// Wraps an array in `(width, height, depth)` layout.
    pub fn from_array(values: Array3<ImagePrecision>) -> Tensor {
        let weights = Array::zeros(values.raw_dim());
        Tensor { values, weights }
    }

    /// Builds a tensor from an array in Pytorch layout (channels, height, width),
    /// which is how images come out of the image crate.
    pub fn from_chw<'a, V>(data: V) -> Tensor
    where
        V: AsArray<'a, ImagePrecision, Ix3>,
    {
        let chw: ArrayView3<ImagePrecision> = data.into();
        // (C, H, W) -> (W, H, C)
        Tensor::from_array(chw.permuted_axes([2, 1, 0]).to_owned())
    }

    pub fn width(&self) -> usize {
        self.values.len_of(Axis(0))
    }

    pub fn height(&self) -> usize {
        self.values.len_of(Axis(1))
    }

    pub fn depth(&self) -> usize {
        self.values.len_of(Axis(2))
    }

    pub fn shape(&self) -> PatchShape {
        PatchShape::new(self.width(), self.height(), self.depth())
    }

    pub fn values(&self) -> ArrayView3<ImagePrecision> {
        self.values.view()
    }

    pub fn values_mut(&mut self) -> ArrayViewMut3<ImagePrecision> {
        self.values.view_mut()
    }

    pub fn get(&self, x: usize, y: usize, z: usize) -> ImagePrecision {
        self.values[[x, y, z]]
    }

    pub fn set(&mut self, x: usize, y: usize, z: usize, value: ImagePrecision) {
        self.values[[x, y, z]] = value;
    }

    pub fn add(&mut self, x: usize, y: usize, z: usize, value: ImagePrecision) {
        self.values[[x, y, z]] += value;
    }

    /// Overlap count of a cell.
    pub fn weight(&self, x: usize, y: usize, z: usize) -> ImagePrecision {
        self.weights[[x, y, z]]
    }

    pub fn weights(&self) -> ArrayView3<ImagePrecision> {
        self.weights.view()
    }

    /// Zeroes values and overlap counts.
    pub fn clear(&mut self) {
        self.values.fill(0.0);
        self.weights.fill(0.0);
    }

    /// Whether a `width x height` window placed at `(x, y)` lies inside this tensor.
    pub fn fits(&self, x: usize, y: usize, width: usize, height: usize) -> bool {
        x + width <= self.width() && y + height <= self.height()
    }

    fn assert_fits(&self, x: usize, y: usize, shape: PatchShape) {
        assert!(
            self.fits(x, y, shape.width, shape.height),
            "Window {}x{} at ({}, {}) exceeds tensor of size {}x{}",
            shape.width,
            shape.height,
            x,
            y,
            self.width(),
            self.height()
        );
        assert_eq!(
            shape.depth,
            self.depth(),
            "Window depth does not match tensor depth"
        );
    }

    /// View on the full-depth window of the given spatial extent at `(x, y)`.
    pub fn window(&self, x: usize, y: usize, width: usize, height: usize) -> ArrayView3<ImagePrecision> {
        self.assert_fits(x, y, PatchShape::new(width, height, self.depth()));
        self.values.slice(s![x..x + width, y..y + height, ..])
    }

    /// Copies a window out as a standalone tensor.
    pub fn patch(&self, x: usize, y: usize, width: usize, height: usize) -> Tensor {
        Tensor::from_array(self.window(x, y, width, height).to_owned())
    }

    /// Flattened window at `(x, y)`, in the order units read their input.
    pub fn patch_vector(&self, x: usize, y: usize, shape: PatchShape) -> Array1<ImagePrecision> {
        self.assert_fits(x, y, shape);
        self.values
            .slice(s![x..x + shape.width, y..y + shape.height, ..])
            .iter()
            .cloned()
            .collect()
    }

    /// Adds a flattened window into the tensor and counts the contribution in the
    /// overlap counters.
    pub fn add_patch(&mut self, x: usize, y: usize, shape: PatchShape, patch: ArrayView1<ImagePrecision>) {
        self.accumulate_patch(x, y, shape, patch);
        self.weights
            .slice_mut(s![x..x + shape.width, y..y + shape.height, ..])
            .mapv_inplace(|w| w + 1.0);
    }

    /// Adds a flattened window into the tensor without touching the overlap counters.
    /// Used for routing errors, which sum instead of average.
    pub fn accumulate_patch(&mut self, x: usize, y: usize, shape: PatchShape, patch: ArrayView1<ImagePrecision>) {
        self.assert_fits(x, y, shape);
        assert_eq!(patch.len(), shape.len(), "Patch length does not match its shape");
        let mut window = self
            .values
            .slice_mut(s![x..x + shape.width, y..y + shape.height, ..]);
        for (cell, value) in window.iter_mut().zip(patch.iter()) {
            *cell += *value;
        }
    }

    /// Marks every cell of a window as written once more, without changing values.
    pub fn count_window(&mut self, x: usize, y: usize, width: usize, height: usize) {
        self.assert_fits(x, y, PatchShape::new(width, height, self.depth()));
        self.weights
            .slice_mut(s![x..x + width, y..y + height, ..])
            .mapv_inplace(|w| w + 1.0);
    }

    /// Divides every written cell by the number of contributions it received.
    /// Cells nobody wrote to are left as they are. Counts are kept for inspection,
    /// so normalizing twice divides twice.
    pub fn normalize_weights(&mut self) {
        Zip::from(&mut self.values)
            .and(&self.weights)
            .for_each(|value, &count| {
                if count > 0.0 {
                    *value /= count;
                }
            });
    }

    /// Depth vector at a spatial position.
    pub fn column(&self, x: usize, y: usize) -> ArrayView1<ImagePrecision> {
        self.values.slice(s![x, y, ..])
    }

    pub fn set_column<'a, V>(&mut self, x: usize, y: usize, column: V)
    where
        V: AsArray<'a, ImagePrecision, Ix1>,
    {
        let column: ArrayView1<ImagePrecision> = column.into();
        self.values.slice_mut(s![x, y, ..]).assign(&column);
    }

    /// Flattened copy of all values in `[x][y][z]` order.
    pub fn to_vec(&self) -> Vec<ImagePrecision> {
        self.values.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimensions() {
        let t = Tensor::new(4, 3, 2);
        assert_eq!(t.width(), 4);
        assert_eq!(t.height(), 3);
        assert_eq!(t.depth(), 2);
        assert_eq!(t.shape().len(), 24);
    }

    #[test]
    fn test_from_chw_layout() {
        // two channels, height 1, width 2
        let chw = array![[[1., 2.]], [[3., 4.]]];
        let t = Tensor::from_chw(&chw);
        assert_eq!(t.shape(), PatchShape::new(2, 1, 2));
        assert_eq!(t.get(0, 0, 0), 1.);
        assert_eq!(t.get(1, 0, 0), 2.);
        assert_eq!(t.get(0, 0, 1), 3.);
        assert_eq!(t.get(1, 0, 1), 4.);
    }

    #[test]
    fn test_patch_vector_order() {
        let mut t = Tensor::new(3, 2, 1);
        for x in 0..3 {
            for y in 0..2 {
                t.set(x, y, 0, (10 * x + y) as f32);
            }
        }
        let patch = t.patch_vector(1, 0, PatchShape::new(2, 2, 1));
        assert_eq!(patch, array![10., 11., 20., 21.]);
    }

    #[test]
    #[should_panic]
    fn test_window_out_of_bounds() {
        let t = Tensor::new(3, 3, 1);
        t.patch_vector(2, 0, PatchShape::new(2, 2, 1));
    }

    #[test]
    #[should_panic]
    fn test_window_depth_mismatch() {
        let t = Tensor::new(3, 3, 2);
        t.patch_vector(0, 0, PatchShape::new(2, 2, 1));
    }

    #[test]
    fn test_overlap_normalization() {
        let mut t = Tensor::new(3, 1, 1);
        let shape = PatchShape::new(2, 1, 1);
        t.add_patch(0, 0, shape, array![1., 2.].view());
        t.add_patch(1, 0, shape, array![4., 6.].view());
        assert_eq!(t.weight(1, 0, 0), 2.);
        t.normalize_weights();
        assert_eq!(t.to_vec(), vec![1., 3., 6.]);
    }

    #[test]
    fn test_accumulate_leaves_counts() {
        let mut t = Tensor::new(2, 1, 1);
        t.accumulate_patch(0, 0, PatchShape::new(2, 1, 1), array![1., 1.].view());
        assert_eq!(t.weights().sum(), 0.);
        assert_eq!(t.to_vec(), vec![1., 1.]);
    }

    #[test]
    fn test_columns() {
        let mut t = Tensor::new(2, 2, 3);
        t.set_column(1, 1, &array![1., 2., 3.]);
        assert_eq!(t.column(1, 1), array![1., 2., 3.]);
        t.clear();
        assert_eq!(t.column(1, 1), array![0., 0., 0.]);
    }
}
