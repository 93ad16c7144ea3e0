use std::f32::consts::TAU;

use nalgebra::{Matrix4, Point3, UnitQuaternion, Vector3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::grass::GrassConfig;
use crate::rendering::graphics::Instance;

/// Blade footprint before random scaling.
const BASE_SIZE: f32 = 0.18;
const SCALE_MIN: f32 = 0.8;
const SCALE_MAX: f32 = 1.2;
/// Squared-length cutoff below which the tangent is considered degenerate.
const TANGENT_EPSILON: f32 = 1e-4;

/// Parallel position/normal arrays in surface-local space. Transient input
/// to generation only.
pub struct SurfaceGeometry {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
}

/// Samples the surface vertices into a set of blade transforms. The whole
/// random stream is derived from `config.random_seed`, so the same surface
/// and config reproduce the same set exactly.
pub fn generate(
    surface: &SurfaceGeometry,
    local_to_world: &Matrix4<f32>,
    config: &GrassConfig,
) -> Vec<Instance> {
    let mut rng = ChaCha8Rng::seed_from_u64(config.random_seed);

    let normals_usable = surface.normals.len() == surface.positions.len();
    if !normals_usable && !surface.positions.is_empty() {
        log::warn!(
            "surface has {} normals for {} vertices, falling back to world up",
            surface.normals.len(),
            surface.positions.len()
        );
    }

    let mut instances = Vec::with_capacity(surface.positions.len());
    for (i, position) in surface.positions.iter().enumerate() {
        // One thinning draw per vertex, taken even for skipped vertices so
        // the survivors of a given seed do not shift when density changes.
        if rng.gen::<f32>() > config.density {
            continue;
        }

        let local_pos = Point3::new(position[0], position[1], position[2]);
        let normal = if normals_usable {
            Vector3::from(surface.normals[i])
        } else {
            Vector3::y()
        };

        let offset = if config.offset_radius > 0.0 {
            let (tangent, bitangent) = tangent_basis(&normal);
            let r = rng.gen_range(0.0..config.offset_radius);
            let a = rng.gen_range(0.0..TAU);
            (a.cos() * tangent + a.sin() * bitangent).normalize() * r
        } else {
            Vector3::zeros()
        };

        let mut world_pos = local_to_world.transform_point(&(local_pos + offset));
        world_pos.y += config.y_lift;

        let world_normal = local_to_world.transform_vector(&normal).normalize();

        let yaw = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), rng.gen_range(0.0..TAU));
        let rotation = if config.align_to_normal {
            align_up_to(&world_normal) * yaw
        } else {
            yaw
        };

        let s = rng.gen_range(SCALE_MIN..SCALE_MAX) * BASE_SIZE;

        instances.push(Instance {
            position: world_pos.coords,
            rotation,
            scale: Vector3::repeat(s),
        });
    }

    instances
}

/// Orthonormal basis of the plane perpendicular to `normal`. Falls back to
/// the world-right axis when the normal is nearly parallel to world-up.
fn tangent_basis(normal: &Vector3<f32>) -> (Vector3<f32>, Vector3<f32>) {
    let mut tangent = normal.cross(&Vector3::y());
    if tangent.norm_squared() < TANGENT_EPSILON {
        tangent = normal.cross(&Vector3::x());
    }
    let tangent = tangent.normalize();
    let bitangent = normal.cross(&tangent);
    (tangent, bitangent)
}

fn align_up_to(world_normal: &Vector3<f32>) -> UnitQuaternion<f32> {
    UnitQuaternion::rotation_between(&Vector3::y(), world_normal).unwrap_or_else(|| {
        // Antiparallel normal: any half-turn through the plane works.
        UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f32::consts::PI)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_surface(count: usize) -> SurfaceGeometry {
        let positions = (0..count)
            .map(|i| [(i % 64) as f32, 0.0, (i / 64) as f32])
            .collect::<Vec<_>>();
        let normals = vec![[0.0, 1.0, 0.0]; count];
        SurfaceGeometry { positions, normals }
    }

    fn raw_bytes(instances: &[Instance]) -> Vec<u8> {
        let raws = instances.iter().map(Instance::to_raw).collect::<Vec<_>>();
        bytemuck::cast_slice(&raws).to_vec()
    }

    #[test]
    fn same_seed_reproduces_bit_identical_output() {
        let surface = flat_surface(500);
        let config = GrassConfig {
            density: 0.7,
            random_seed: 42,
            ..Default::default()
        };
        let first = generate(&surface, &Matrix4::identity(), &config);
        let second = generate(&surface, &Matrix4::identity(), &config);
        assert_eq!(first.len(), second.len());
        assert_eq!(raw_bytes(&first), raw_bytes(&second));
    }

    #[test]
    fn different_seeds_diverge() {
        let surface = flat_surface(200);
        let a = generate(
            &surface,
            &Matrix4::identity(),
            &GrassConfig {
                random_seed: 1,
                ..Default::default()
            },
        );
        let b = generate(
            &surface,
            &Matrix4::identity(),
            &GrassConfig {
                random_seed: 2,
                ..Default::default()
            },
        );
        assert_ne!(raw_bytes(&a), raw_bytes(&b));
    }

    #[test]
    fn empty_surface_yields_empty_set() {
        let surface = SurfaceGeometry {
            positions: Vec::new(),
            normals: Vec::new(),
        };
        let instances = generate(&surface, &Matrix4::identity(), &GrassConfig::default());
        assert!(instances.is_empty());
    }

    #[test]
    fn full_density_keeps_every_vertex() {
        let surface = flat_surface(300);
        let config = GrassConfig {
            density: 1.0,
            ..Default::default()
        };
        let instances = generate(&surface, &Matrix4::identity(), &config);
        assert_eq!(instances.len(), 300);
    }

    #[test]
    fn density_behaves_like_bernoulli_thinning() {
        // Per-seed count is Binomial(k, d); 4000 * 0.5 has sigma ~= 31, so a
        // +-250 band is far outside any plausible fluctuation.
        let surface = flat_surface(4000);
        for seed in 0..8 {
            let config = GrassConfig {
                density: 0.5,
                random_seed: seed,
                ..Default::default()
            };
            let count = generate(&surface, &Matrix4::identity(), &config).len() as i64;
            assert!(
                (count - 2000).abs() < 250,
                "seed {} produced {} survivors",
                seed,
                count
            );
        }
    }

    #[test]
    fn zero_offset_places_blades_on_vertices() {
        let surface = flat_surface(10);
        let config = GrassConfig {
            density: 1.0,
            offset_radius: 0.0,
            y_lift: 0.25,
            ..Default::default()
        };
        let instances = generate(&surface, &Matrix4::identity(), &config);
        for (instance, vertex) in instances.iter().zip(&surface.positions) {
            assert_eq!(instance.position.x, vertex[0]);
            assert_eq!(instance.position.z, vertex[2]);
            assert_eq!(instance.position.y, 0.25);
        }
    }

    #[test]
    fn offsets_stay_within_radius() {
        let surface = flat_surface(200);
        let config = GrassConfig {
            density: 1.0,
            offset_radius: 0.3,
            y_lift: 0.0,
            ..Default::default()
        };
        let instances = generate(&surface, &Matrix4::identity(), &config);
        for (instance, vertex) in instances.iter().zip(&surface.positions) {
            let dx = instance.position.x - vertex[0];
            let dz = instance.position.z - vertex[2];
            let planar = (dx * dx + dz * dz).sqrt();
            assert!(planar <= 0.3 + 1e-5, "offset {} exceeds radius", planar);
            assert!(instance.position.iter().all(|c| c.is_finite()));
        }
    }

    #[test]
    fn aligned_rotation_maps_up_onto_surface_normal() {
        let normal = Vector3::new(0.3_f32, 0.9, 0.1).normalize();
        let surface = SurfaceGeometry {
            positions: vec![[0.0, 0.0, 0.0]; 16],
            normals: vec![[normal.x, normal.y, normal.z]; 16],
        };
        let config = GrassConfig {
            density: 1.0,
            align_to_normal: true,
            ..Default::default()
        };
        let instances = generate(&surface, &Matrix4::identity(), &config);
        for instance in &instances {
            let up = instance.rotation * Vector3::y();
            assert!((up - normal).norm() < 1e-4);
        }
    }

    #[test]
    fn mismatched_normals_fall_back_to_world_up() {
        let surface = SurfaceGeometry {
            positions: vec![[0.0, 0.0, 0.0]; 8],
            normals: vec![[1.0, 0.0, 0.0]; 3],
        };
        let config = GrassConfig {
            density: 1.0,
            align_to_normal: true,
            ..Default::default()
        };
        let instances = generate(&surface, &Matrix4::identity(), &config);
        assert_eq!(instances.len(), 8);
        for instance in &instances {
            let up = instance.rotation * Vector3::y();
            assert!((up - Vector3::y()).norm() < 1e-4);
        }
    }

    #[test]
    fn scale_stays_in_configured_band() {
        let surface = flat_surface(300);
        let config = GrassConfig {
            density: 1.0,
            ..Default::default()
        };
        let instances = generate(&surface, &Matrix4::identity(), &config);
        for instance in &instances {
            let s = instance.scale.x;
            assert!(s >= SCALE_MIN * BASE_SIZE && s < SCALE_MAX * BASE_SIZE);
            assert_eq!(instance.scale.y, s);
            assert_eq!(instance.scale.z, s);
        }
    }

    #[test]
    fn vertical_normal_uses_fallback_tangent() {
        // normal x up is zero, so the basis must come from the right axis.
        let (tangent, bitangent) = tangent_basis(&Vector3::y());
        assert!(tangent.norm_squared() > 0.9);
        assert!(bitangent.norm_squared() > 0.9);
        assert!(tangent.dot(&bitangent).abs() < 1e-5);
        assert!(tangent.dot(&Vector3::y()).abs() < 1e-5);
    }

    #[test]
    fn local_to_world_transform_is_applied() {
        let surface = flat_surface(4);
        let config = GrassConfig {
            density: 1.0,
            offset_radius: 0.0,
            y_lift: 0.0,
            ..Default::default()
        };
        let transform = Matrix4::new_translation(&Vector3::new(10.0, 5.0, -2.0));
        let instances = generate(&surface, &transform, &config);
        for (instance, vertex) in instances.iter().zip(&surface.positions) {
            assert_eq!(instance.position.x, vertex[0] + 10.0);
            assert_eq!(instance.position.y, 5.0);
            assert_eq!(instance.position.z, vertex[2] - 2.0);
        }
    }
}
