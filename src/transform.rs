/// Rotation matrix for intrinsic rotations about x, then y, then z, in degrees.
pub fn rotation_matrix([rx, ry, rz]: [f64; 3]) -> [[f64; 3]; 3] {
    let (sx, cx) = rx.to_radians().sin_cos();
    let (sy, cy) = ry.to_radians().sin_cos();
    let (sz, cz) = rz.to_radians().sin_cos();
    let rot_x = [[1.0, 0.0, 0.0], [0.0, cx, -sx], [0.0, sx, cx]];
    let rot_y = [[cy, 0.0, sy], [0.0, 1.0, 0.0], [-sy, 0.0, cy]];
    let rot_z = [[cz, -sz, 0.0], [sz, cz, 0.0], [0.0, 0.0, 1.0]];
    mat_mul(&mat_mul(&rot_x, &rot_y), &rot_z)
}

fn mat_mul(a: &[[f64; 3]; 3], b: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    std::array::from_fn(|i| std::array::from_fn(|j| (0..3).map(|k| a[i][k] * b[k][j]).sum()))
}

fn squared_distance(a: [f64; 3], b: [f64; 3]) -> f64 {
    (0..3).map(|axis| (a[axis] - b[axis]).powi(2)).sum()
}

pub struct PointCloudTransformer;

impl PointCloudTransformer {
    /// Rotate every point about `center` by `angles_deg` (x, then y, then z).
    pub fn rotate_about_center(points: &mut [[f64; 3]], center: [f64; 3], angles_deg: [f64; 3]) {
        if angles_deg == [0.0; 3] {
            return;
        }
        let rotation = rotation_matrix(angles_deg);
        for point in points.iter_mut() {
            let local: [f64; 3] = std::array::from_fn(|axis| point[axis] - center[axis]);
            *point = std::array::from_fn(|i| {
                center[i] + (0..3).map(|k| rotation[i][k] * local[k]).sum::<f64>()
            });
        }
    }

    /// Index of the point closest to `target`, first one on ties.
    pub fn nearest(points: &[[f64; 3]], target: [f64; 3]) -> Option<usize> {
        points
            .iter()
            .enumerate()
            .map(|(i, p)| (i, squared_distance(*p, target)))
            .fold(None, |best: Option<(usize, f64)>, (i, d)| match best {
                Some((_, best_d)) if best_d <= d => best,
                _ => Some((i, d)),
            })
            .map(|(i, _)| i)
    }

    /// Translate all points so the one nearest `point0` lands on it. Returns
    /// the index of that point, which is set to `point0` exactly.
    pub fn anchor_to_reference(points: &mut [[f64; 3]], point0: [f64; 3]) -> Option<usize> {
        let anchor = Self::nearest(points, point0)?;
        let nearest = points[anchor];
        let offset: [f64; 3] = std::array::from_fn(|axis| point0[axis] - nearest[axis]);
        for point in points.iter_mut() {
            for axis in 0..3 {
                point[axis] += offset[axis];
            }
        }
        points[anchor] = point0;
        Some(anchor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn rotation_order_is_x_then_y_then_z() {
        let r = rotation_matrix([90.0, 0.0, 90.0]);
        // Rx(90) * Rz(90) applied to +x: Rz takes x to y, Rx takes y to z
        let v = [1.0, 0.0, 0.0];
        let out: Vec<f64> = (0..3).map(|i| (0..3).map(|k| r[i][k] * v[k]).sum()).collect();
        assert_relative_eq!(out[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(out[1], 0.0, epsilon = 1e-12);
        assert_relative_eq!(out[2], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn rotation_keeps_center_fixed() {
        let mut points = vec![[5.0, 5.0, 5.0], [6.0, 5.0, 5.0]];
        PointCloudTransformer::rotate_about_center(&mut points, [5.0, 5.0, 5.0], [0.0, 0.0, 90.0]);
        assert_eq!(points[0], [5.0, 5.0, 5.0]);
        assert_relative_eq!(points[1][0], 5.0, epsilon = 1e-12);
        assert_relative_eq!(points[1][1], 6.0, epsilon = 1e-12);
    }

    #[test]
    fn anchoring_moves_everything_by_the_same_offset() {
        let mut points = vec![[0.0, 0.0, 0.0], [10.0, 0.0, 0.0], [20.0, 0.0, 0.0]];
        let anchor = PointCloudTransformer::anchor_to_reference(&mut points, [11.5, 0.25, 0.0]);
        assert_eq!(anchor, Some(1));
        assert_eq!(points[1], [11.5, 0.25, 0.0]);
        assert_eq!(points[0], [1.5, 0.25, 0.0]);
        assert_eq!(points[2], [21.5, 0.25, 0.0]);

        assert_eq!(PointCloudTransformer::anchor_to_reference(&mut [], [0.0; 3]), None);
    }
}
