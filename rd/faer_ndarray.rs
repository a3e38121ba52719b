use faer::diag::DiagRef;
use faer::linalg::solvers::{self, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

/// Borrows row-major `ndarray` storage in place, copying only for
/// non-contiguous or column-major views.
enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

impl FaerStorage<'_> {
    fn view(&self) -> MatRef<'_, f64> {
        match self {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

fn matrix_storage<S: Data<Elem = f64>>(array: &ArrayBase<S, Ix2>) -> FaerStorage<'_> {
    match array.as_slice() {
        Some(slice) => {
            FaerStorage::Borrowed(MatRef::from_row_major_slice(slice, array.nrows(), array.ncols()))
        }
        None => {
            let (rows, cols) = array.dim();
            FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
        }
    }
}

fn column_storage<S: Data<Elem = f64>>(array: &ArrayBase<S, Ix1>) -> FaerStorage<'_> {
    let len = array.len();
    match array.as_slice() {
        Some(slice) => FaerStorage::Borrowed(MatRef::from_row_major_slice(slice, len, 1)),
        None => FaerStorage::Owned(Mat::from_fn(len, 1, |i, _| array[i])),
    }
}

pub trait FaerEigh {
    /// Eigenvalues of a symmetric matrix, ascending.
    fn symmetric_eigenvalues(&self) -> Result<Array1<f64>, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerEigh for ArrayBase<S, Ix2> {
    fn symmetric_eigenvalues(&self) -> Result<Array1<f64>, FaerLinalgError> {
        let storage = matrix_storage(self);
        let eigen = storage
            .view()
            .self_adjoint_eigen(Side::Lower)
            .map_err(FaerLinalgError::SelfAdjointEigen)?;
        let mut values = diag_to_array(eigen.S()).to_vec();
        values.sort_by(f64::total_cmp);
        Ok(Array1::from_vec(values))
    }
}

pub struct FaerCholeskyFactor {
    factor: solvers::Llt<f64>,
    dim: usize,
}

impl FaerCholeskyFactor {
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let storage = column_storage(rhs);
        let sol = self.factor.solve(storage.view());
        Array1::from_shape_fn(rhs.len(), |i| sol[(i, 0)])
    }

    /// Inverse of the factorised matrix, used for coefficient covariances.
    pub fn inverse(&self) -> Array2<f64> {
        let identity = Mat::<f64>::from_fn(self.dim, self.dim, |i, j| if i == j { 1.0 } else { 0.0 });
        let sol = self.factor.solve(identity.as_ref());
        mat_to_array(sol.as_ref())
    }
}

pub trait FaerCholesky {
    fn cholesky(&self) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        let storage = matrix_storage(self);
        let factor = storage
            .view()
            .llt(Side::Lower)
            .map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor {
            factor,
            dim: self.nrows(),
        })
    }
}
