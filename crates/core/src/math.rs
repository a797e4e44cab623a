use glam::{DMat3, DVec3};

pub fn dmat3_is_finite(mat: DMat3) -> bool {
    mat.to_cols_array().iter().all(|value| value.is_finite())
}

/// Outer product `a * b^T`.
pub fn outer(a: DVec3, b: DVec3) -> DMat3 {
    DMat3::from_cols(a * b.x, a * b.y, a * b.z)
}

/// Jacobi eigen decomposition of a symmetric matrix. Eigenvalues come back
/// in ascending order, with the matching unit eigenvectors as columns.
#[allow(clippy::needless_range_loop)]
pub fn eigen_decomposition_symmetric(mat: DMat3) -> (DVec3, DMat3) {
    let cols = mat.to_cols_array_2d();
    let mut a = [
        [cols[0][0], cols[1][0], cols[2][0]],
        [cols[0][1], cols[1][1], cols[2][1]],
        [cols[0][2], cols[1][2], cols[2][2]],
    ];
    let mut v = [[1.0f64, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

    const MAX_ITERS: usize = 32;
    let scale = a[0][0].abs().max(a[1][1].abs()).max(a[2][2].abs());
    let eps = 1.0e-14 * scale.max(f64::MIN_POSITIVE);

    for _ in 0..MAX_ITERS {
        let mut p = 0usize;
        let mut q = 1usize;
        let mut max = a[0][1].abs();

        let a02 = a[0][2].abs();
        if a02 > max {
            max = a02;
            p = 0;
            q = 2;
        }
        let a12 = a[1][2].abs();
        if a12 > max {
            max = a12;
            p = 1;
            q = 2;
        }

        if max <= eps {
            break;
        }

        let app = a[p][p];
        let aqq = a[q][q];
        let apq = a[p][q];

        let tau = (aqq - app) / (2.0 * apq);
        let t = if tau >= 0.0 {
            1.0 / (tau + (1.0 + tau * tau).sqrt())
        } else {
            -1.0 / (-tau + (1.0 + tau * tau).sqrt())
        };
        let c = 1.0 / (1.0 + t * t).sqrt();
        let s = t * c;

        for i in 0..3 {
            if i == p || i == q {
                continue;
            }
            let aip = a[i][p];
            let aiq = a[i][q];
            a[i][p] = c * aip - s * aiq;
            a[p][i] = a[i][p];
            a[i][q] = s * aip + c * aiq;
            a[q][i] = a[i][q];
        }

        a[p][p] = c * c * app - 2.0 * s * c * apq + s * s * aqq;
        a[q][q] = s * s * app + 2.0 * s * c * apq + c * c * aqq;
        a[p][q] = 0.0;
        a[q][p] = 0.0;

        for i in 0..3 {
            let vip = v[i][p];
            let viq = v[i][q];
            v[i][p] = c * vip - s * viq;
            v[i][q] = s * vip + c * viq;
        }
    }

    let mut order = [0usize, 1, 2];
    order.sort_by(|&i, &j| a[i][i].total_cmp(&a[j][j]));
    let column = |k: usize| DVec3::new(v[0][k], v[1][k], v[2][k]);
    let eigenvalues = DVec3::new(a[order[0]][order[0]], a[order[1]][order[1]], a[order[2]][order[2]]);
    let eigenvectors = DMat3::from_cols(column(order[0]), column(order[1]), column(order[2]));
    (eigenvalues, eigenvectors)
}
