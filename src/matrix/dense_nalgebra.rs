use nalgebra::DMatrix;

use super::{IndexType, Matrix};
use crate::scalar::Scalar;
use crate::vector::serial::SerialVector;

#[derive(Clone, Debug)]
pub struct DenseMatrix<T: Scalar>(pub DMatrix<T>);

impl<T: Scalar> std::ops::Index<(IndexType, IndexType)> for DenseMatrix<T> {
    type Output = T;
    fn index(&self, (i, j): (IndexType, IndexType)) -> &T {
        &self.0[(i, j)]
    }
}
impl<T: Scalar> std::ops::IndexMut<(IndexType, IndexType)> for DenseMatrix<T> {
    fn index_mut(&mut self, (i, j): (IndexType, IndexType)) -> &mut T {
        &mut self.0[(i, j)]
    }
}

impl<T: Scalar> Matrix for DenseMatrix<T> {
    type T = T;
    type V = SerialVector<T>;

    fn zeros(nrows: IndexType, ncols: IndexType) -> Self {
        DenseMatrix(DMatrix::zeros(nrows, ncols))
    }

    fn identity(n: IndexType) -> Self {
        DenseMatrix(DMatrix::identity(n, n))
    }

    fn from_diagonal(v: &Self::V) -> Self {
        DenseMatrix(DMatrix::from_diagonal(&v.0))
    }

    fn nrows(&self) -> IndexType {
        self.0.nrows()
    }

    fn ncols(&self) -> IndexType {
        self.0.ncols()
    }

    fn gemv(&self, alpha: T, x: &Self::V, beta: T, y: &mut Self::V) {
        y.0.gemv(alpha, &self.0, &x.0, beta);
    }

    fn axpy(&mut self, alpha: T, other: &Self) {
        self.0.axpy(alpha, &other.0, T::one());
    }
}
