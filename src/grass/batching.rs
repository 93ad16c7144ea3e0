use std::ops::Range;

use nalgebra::Point3;
use wgpu::util::DeviceExt;

use crate::grass::{GrassConfig, LodTier};
use crate::rendering::graphics::{Instance, InstanceRaw};

/// One direct instanced draw worth of grass, produced by the host-side
/// fallback partition. Rebuilt from scratch every frame.
pub struct GrassBatch {
    pub tier: LodTier,
    pub instance_buffer: wgpu::Buffer,
    pub instance_count: u32,
}

fn squared_distance(instance: &Instance, viewer: &Point3<f32>, planar: bool) -> f32 {
    let delta = instance.position - viewer.coords;
    if planar {
        delta.x * delta.x + delta.z * delta.z
    } else {
        delta.norm_squared()
    }
}

/// Splits the instance set by the viewer-distance predicate. Every instance
/// lands in exactly one tier; distances equal to the threshold go far, and a
/// missing viewer sends everything far.
pub fn partition_by_distance<'a>(
    instances: &'a [Instance],
    viewer: Option<&Point3<f32>>,
    config: &GrassConfig,
) -> (Vec<&'a Instance>, Vec<&'a Instance>) {
    let mut near = Vec::new();
    let mut far = Vec::new();
    match viewer {
        Some(viewer) => {
            let threshold_sqr = config.lod_distance * config.lod_distance;
            for instance in instances {
                if squared_distance(instance, viewer, config.planar_distance) < threshold_sqr {
                    near.push(instance);
                } else {
                    far.push(instance);
                }
            }
        }
        None => far.extend(instances.iter()),
    }
    (near, far)
}

/// Contiguous index ranges covering `count` items with no range longer than
/// `max_per_draw`.
pub fn chunk_ranges(count: usize, max_per_draw: usize) -> Vec<Range<usize>> {
    let max_per_draw = max_per_draw.max(1);
    let mut ranges = Vec::with_capacity(count / max_per_draw + 1);
    let mut start = 0;
    while start < count {
        let end = (start + max_per_draw).min(count);
        ranges.push(start..end);
        start = end;
    }
    ranges
}

/// Partitions and chunks for this frame, uploading one vertex-steppable
/// instance buffer per chunk. Empty chunks never materialize.
pub fn build_batches(
    device: &wgpu::Device,
    instances: &[Instance],
    viewer: Option<&Point3<f32>>,
    config: &GrassConfig,
) -> Vec<GrassBatch> {
    let (near, far) = partition_by_distance(instances, viewer, config);

    let mut batches = Vec::new();
    for (tier, tier_instances) in [(LodTier::Near, near), (LodTier::Far, far)] {
        let raws = tier_instances
            .iter()
            .map(|instance| instance.to_raw())
            .collect::<Vec<InstanceRaw>>();
        for range in chunk_ranges(raws.len(), config.max_instances_per_draw as usize) {
            let chunk = &raws[range];
            let instance_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Grass Instance Buffer"),
                contents: bytemuck::cast_slice(chunk),
                usage: wgpu::BufferUsages::VERTEX,
            });
            batches.push(GrassBatch {
                tier,
                instance_buffer,
                instance_count: chunk.len() as u32,
            });
        }
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grass::placement::{self, SurfaceGeometry};
    use nalgebra::{Matrix4, UnitQuaternion, Vector3};

    fn instance_at(x: f32, y: f32, z: f32) -> Instance {
        Instance {
            position: Vector3::new(x, y, z),
            rotation: UnitQuaternion::identity(),
            scale: Vector3::repeat(1.0),
        }
    }

    fn config(lod_distance: f32) -> GrassConfig {
        GrassConfig {
            lod_distance,
            ..Default::default()
        }
    }

    fn spread(count: usize) -> Vec<Instance> {
        (0..count)
            .map(|i| instance_at(i as f32 * 0.37, 0.0, (i % 17) as f32))
            .collect()
    }

    #[test]
    fn partition_covers_every_instance_exactly_once() {
        let instances = spread(500);
        let viewer = Point3::new(3.0, 0.0, 4.0);
        let (near, far) = partition_by_distance(&instances, Some(&viewer), &config(10.0));
        assert_eq!(near.len() + far.len(), instances.len());
    }

    #[test]
    fn partition_respects_the_distance_predicate() {
        let instances = spread(500);
        let viewer = Point3::new(3.0, 0.0, 4.0);
        let cfg = config(10.0);
        let (near, far) = partition_by_distance(&instances, Some(&viewer), &cfg);
        for instance in near {
            assert!((instance.position - viewer.coords).norm_squared() < 100.0);
        }
        for instance in far {
            assert!((instance.position - viewer.coords).norm_squared() >= 100.0);
        }
    }

    #[test]
    fn boundary_distance_resolves_far() {
        let instances = vec![instance_at(3.0, 0.0, 0.0)];
        let viewer = Point3::origin();
        let (near, far) = partition_by_distance(&instances, Some(&viewer), &config(3.0));
        assert!(near.is_empty());
        assert_eq!(far.len(), 1);
    }

    #[test]
    fn missing_viewer_sends_everything_far() {
        let instances = spread(50);
        let (near, far) = partition_by_distance(&instances, None, &config(1000.0));
        assert!(near.is_empty());
        assert_eq!(far.len(), 50);
    }

    #[test]
    fn planar_metric_ignores_height() {
        let instances = vec![instance_at(0.0, 100.0, 0.0)];
        let viewer = Point3::origin();

        let mut cfg = config(1.0);
        cfg.planar_distance = true;
        let (near, _) = partition_by_distance(&instances, Some(&viewer), &cfg);
        assert_eq!(near.len(), 1);

        cfg.planar_distance = false;
        let (near, far) = partition_by_distance(&instances, Some(&viewer), &cfg);
        assert!(near.is_empty());
        assert_eq!(far.len(), 1);
    }

    #[test]
    fn four_corner_scenario_partitions_as_expected() {
        let surface = SurfaceGeometry {
            positions: vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0],
                [1.0, 0.0, 1.0],
            ],
            normals: vec![[0.0, 1.0, 0.0]; 4],
        };
        let mut cfg = GrassConfig {
            density: 1.0,
            offset_radius: 0.0,
            y_lift: 0.0,
            align_to_normal: true,
            ..Default::default()
        };
        let instances = placement::generate(&surface, &Matrix4::identity(), &cfg);
        assert_eq!(instances.len(), 4);

        let viewer = Point3::origin();

        cfg.lod_distance = 0.5;
        let (near, far) = partition_by_distance(&instances, Some(&viewer), &cfg);
        assert_eq!(near.len(), 1);
        assert_eq!(far.len(), 3);
        assert_eq!(near[0].position, Vector3::zeros());

        cfg.lod_distance = 2.0;
        let (near, far) = partition_by_distance(&instances, Some(&viewer), &cfg);
        assert_eq!(near.len(), 4);
        assert!(far.is_empty());
    }

    #[test]
    fn chunks_respect_the_per_draw_cap() {
        let ranges = chunk_ranges(2500, 1023);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0], 0..1023);
        assert_eq!(ranges[1], 1023..2046);
        assert_eq!(ranges[2], 2046..2500);
        assert!(ranges.iter().all(|r| r.len() <= 1023));
        assert_eq!(ranges.iter().map(|r| r.len()).sum::<usize>(), 2500);
    }

    #[test]
    fn chunking_nothing_yields_no_ranges() {
        assert!(chunk_ranges(0, 1023).is_empty());
    }

    #[test]
    fn zero_cap_still_makes_progress() {
        let ranges = chunk_ranges(3, 0);
        assert_eq!(ranges.len(), 3);
    }
}
