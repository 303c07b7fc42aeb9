use dvc_volume::{
    builder::{BuildOutcome, MaskedPointCloudBuilder},
    enums::{Dimensionality, Orientation, SubvolumeShape},
    mask::{Mask, MaskModel, empty_mask, erode, erosion_kernel_size},
    pointcloud::{PointCloud, PointRecord},
    sampler::SamplingPlane,
    subvolume::SubvolumeSpec,
    volume::VolumeGeometry,
};
use ndarray::s;

/// Two overlapping blocks with a tunnel drilled through them.
fn irregular_mask(geometry: &VolumeGeometry) -> Mask {
    let mut mask = empty_mask(geometry);
    mask.data.slice_mut(s![2..30, 4..26, 3..20]).fill(1);
    mask.data.slice_mut(s![10..36, 12..34, 14..38]).fill(1);
    mask.data.slice_mut(s![.., 15..18, 16..19]).fill(0);
    mask
}

fn spec(shape: SubvolumeShape, size: u32, dimensionality: Dimensionality) -> SubvolumeSpec {
    SubvolumeSpec::new(shape, size, [0.0; 3], dimensionality)
        .unwrap()
        .with_erosion(1.0)
        .unwrap()
}

/// Every voxel within `reach` of `[x, y, z]` along the given axes is set.
fn neighbourhood_inside(mask: &Mask, [x, y, z]: [usize; 3], reach: [usize; 3]) -> bool {
    let [dx, dy, dz] = mask.geometry.dimensions;
    let range = |c: usize, r: usize, n: usize| (c >= r && c + r < n).then(|| c - r..=c + r);
    let (Some(xs), Some(ys), Some(zs)) = (range(x, reach[0], dx), range(y, reach[1], dy), range(z, reach[2], dz))
    else {
        return false;
    };
    mask.data.slice(s![zs, ys, xs]).iter().all(|&v| v == 1)
}

#[test]
fn eroded_voxels_keep_their_subvolume_inside_the_mask() {
    let geometry = VolumeGeometry::with_dimensions([40, 36, 38]);
    let mask = irregular_mask(&geometry);
    let cases = [
        (SubvolumeShape::Cube, Dimensionality::Three, Orientation::XY),
        (SubvolumeShape::Sphere, Dimensionality::Three, Orientation::XY),
        (SubvolumeShape::Cube, Dimensionality::Two, Orientation::XZ),
        (SubvolumeShape::Sphere, Dimensionality::Two, Orientation::YZ),
    ];
    for (shape, dimensionality, orientation) in cases {
        let size = 6;
        let kernel = erosion_kernel_size(&spec(shape, size, dimensionality), orientation);
        let eroded = erode(&mask, kernel);

        let mut reach = [size as usize / 2; 3];
        if dimensionality == Dimensionality::Two {
            reach[orientation.through_plane_axis()] = 0;
        }
        let mut survivors = 0;
        for ((z, y, x), &v) in eroded.data.indexed_iter() {
            if v == 1 {
                survivors += 1;
                assert!(
                    neighbourhood_inside(&mask, [x, y, z], reach),
                    "{shape:?} {dimensionality:?} voxel {:?} leaves the mask",
                    [x, y, z]
                );
            }
        }
        assert!(survivors > 0, "{shape:?} {dimensionality:?} eroded everything");
    }
}

#[test]
fn kernel_sizes() {
    let cube = SubvolumeSpec::new(SubvolumeShape::Cube, 30, [0.2; 3], Dimensionality::Three).unwrap();
    assert_eq!(erosion_kernel_size(&cube, Orientation::XY), [31, 31, 31]);

    let sphere = SubvolumeSpec::new(SubvolumeShape::Sphere, 30, [0.2; 3], Dimensionality::Two).unwrap();
    assert_eq!(erosion_kernel_size(&sphere, Orientation::XY), [61, 61, 3]);
    assert_eq!(erosion_kernel_size(&sphere, Orientation::YZ), [3, 61, 61]);
}

#[test]
fn anchored_cloud_starts_at_point0_with_consecutive_ids() {
    let geometry = VolumeGeometry::new([40, 36, 38], [0.5, 0.5, 1.0], [-3.0, 2.0, 10.0]);
    let mask = MaskModel::from_mask(&geometry, irregular_mask(&geometry)).unwrap();
    let point0 = geometry.index_to_world([20.0, 20.0, 20.0]);
    let spec = SubvolumeSpec::new(SubvolumeShape::Sphere, 8, [0.3, 0.2, 0.1], Dimensionality::Three)
        .unwrap()
        .with_rotation([0.1, -0.2, 0.3]);

    let cloud = MaskedPointCloudBuilder::new()
        .build(&mask, &spec, Some(point0), SamplingPlane::default())
        .unwrap()
        .into_cloud()
        .unwrap();

    let first = cloud.first().unwrap();
    assert_eq!(first.id, 1);
    assert_eq!(first.position, point0);

    let mut ids: Vec<u32> = cloud.points().iter().map(|p| p.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, (1..=cloud.len() as u32).collect::<Vec<_>>());
}

#[test]
fn empty_mask_builds_nothing() {
    let geometry = VolumeGeometry::with_dimensions([16, 16, 16]);
    let mask = MaskModel::new(&geometry);
    let mut builder = MaskedPointCloudBuilder::new();
    for dimensionality in [Dimensionality::Two, Dimensionality::Three] {
        let outcome = builder
            .build(
                &mask,
                &spec(SubvolumeShape::Cube, 4, dimensionality),
                Some([8.0, 8.0, 8.0]),
                SamplingPlane::new(Orientation::XY, 8),
            )
            .unwrap();
        assert_eq!(outcome, BuildOutcome::Empty);
    }
}

#[test]
fn saved_cloud_loads_back_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cloud.roi");
    let cloud = PointCloud::from_records(vec![
        PointRecord {
            id: 2,
            position: [1.25, -3.5, 0.125],
        },
        PointRecord {
            id: 1,
            position: [100.0, 42.001, 7.0],
        },
    ]);
    cloud.save(&path).unwrap();
    assert_eq!(PointCloud::load(&path).unwrap(), cloud);
}

#[test]
fn mask_survives_a_save_load_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mask.mha");
    let geometry = VolumeGeometry::new([20, 18, 16], [0.5, 0.5, 2.0], [1.0, 2.0, 3.0]);
    let mut model = MaskModel::new(&geometry);
    model
        .extend(&[[3.0, 3.0], [8.0, 3.0], [8.0, 9.0], [3.0, 9.0]], 4, Orientation::XY, 2, 3, false)
        .unwrap();
    model.save(&path).unwrap();

    let loaded = MaskModel::load(&path, &geometry).unwrap();
    assert_eq!(loaded.mask().data, model.mask().data);
    assert_ne!(loaded.version(), model.version());

    let other = VolumeGeometry::with_dimensions([20, 18, 15]);
    assert!(MaskModel::load(&path, &other).is_err());
}
