//! Loader adapters converge on the same mesh invariants.

use glam::Vec3;
use headless_rt::loader::{self, LoaderConfig, ModelSource, Primitive, SceneDescription};
use headless_rt::model::{Material, RawMesh, Vertex};
use headless_rt::Error;

const QUAD_OBJ: &str = "\
mtllib quad.mtl
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
usemtl red
f 1 2 3 4
";

const QUAD_MTL: &str = "\
newmtl red
Kd 1 0 0
";

fn check_invariants(mesh: &headless_rt::model::Mesh) {
    assert_eq!(mesh.indices().len() % 3, 0);
    assert_eq!(mesh.material_indices().len(), mesh.indices().len() / 3);
    assert!(!mesh.materials().is_empty());
    assert!(mesh
        .material_indices()
        .iter()
        .all(|&m| (m as usize) < mesh.materials().len()));
    for v in mesh.vertices() {
        assert!((v.normal().length() - 1.0).abs() < 1e-5);
    }
}

#[test]
fn test_obj_through_search_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("quad.obj"), QUAD_OBJ).expect("write obj");
    std::fs::write(dir.path().join("quad.mtl"), QUAD_MTL).expect("write mtl");

    let config = LoaderConfig::with_search_paths([dir.path()]);
    let mesh = loader::load(&ModelSource::obj_file("quad.obj"), &config).expect("load");
    check_invariants(&mesh);
    assert_eq!(mesh.triangle_count(), 2);
    assert_eq!(mesh.materials()[0].diffuse, [1.0, 0.0, 0.0]);
    // fan: (0,1,2) and (0,2,3), corners flattened
    assert_eq!(mesh.triangle(0), [Vec3::ZERO, Vec3::X, Vec3::new(1.0, 1.0, 0.0)]);
    assert_eq!(mesh.triangle(1), [Vec3::ZERO, Vec3::new(1.0, 1.0, 0.0), Vec3::Y]);

    let err = loader::load(&ModelSource::obj_file("quad.obj"), &LoaderConfig::default()).unwrap_err();
    assert!(matches!(err, Error::Load { .. }));
    assert!(err.is_recoverable());
}

#[test]
fn test_triangle_without_normals_gets_face_normal() {
    let obj = "v 0 0 0\nv 2 0 0\nv 0 0 -2\nf 1 2 3\n";
    let mesh = loader::load(
        &ModelSource::ObjText {
            name: "tri".into(),
            obj: obj.into(),
            mtl: None,
        },
        &LoaderConfig::default(),
    )
    .expect("load");
    check_invariants(&mesh);
    assert!(mesh.has_generated_normals());

    let [a, b, c] = mesh.triangle(0);
    let expected = (b - a).cross(c - a).normalize();
    for v in mesh.vertices() {
        assert!((v.normal() - expected).length() < 1e-6);
    }
    // zero materials in the source -> one default, used by every triangle
    assert_eq!(mesh.materials(), &[Material::default()]);
    assert_eq!(mesh.material_indices(), &[0]);
}

#[test]
fn test_out_of_range_material_ids_clamp_to_zero() {
    let mut raw = RawMesh::new("clamped");
    let corner = |p: Vec3| Vertex::new(p, Vec3::Z, Vec3::ONE, glam::Vec2::ZERO);
    raw.push_triangle([corner(Vec3::ZERO), corner(Vec3::X), corner(Vec3::Y)], -1);
    raw.push_triangle([corner(Vec3::ZERO), corner(Vec3::Y), corner(Vec3::NEG_X)], 999);
    raw.push_triangle([corner(Vec3::ZERO), corner(Vec3::NEG_X), corner(Vec3::NEG_Y)], 1);
    raw.materials = vec![Material::default(), Material::with_diffuse([0.0, 1.0, 0.0])];
    raw.has_normals = true;

    let mesh = raw.normalize().expect("normalize");
    check_invariants(&mesh);
    assert_eq!(mesh.material_indices(), &[0, 0, 1]);
}

#[test]
fn test_scene_description_mismatch_is_consistency_error() {
    let desc = SceneDescription {
        name: "broken".into(),
        points: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        face_vertex_counts: vec![3],
        face_vertex_indices: vec![0, 1, 2],
        normals: vec![[0.0, 0.0, 1.0]; 2],
        ..Default::default()
    };
    let err = loader::load(&ModelSource::Scene(desc), &LoaderConfig::default()).unwrap_err();
    assert!(matches!(err, Error::Consistency { .. }));
    assert!(err.is_recoverable());
}

#[test]
fn test_every_adapter_obeys_invariants() {
    let sources = [
        ModelSource::procedural(Primitive::Triangle),
        ModelSource::procedural(Primitive::Plane {
            size: 1.0,
            subdivisions: 3,
        }),
        ModelSource::procedural(Primitive::Cube { size: 2.0 }),
        ModelSource::procedural(Primitive::Sphere {
            radius: 0.5,
            segments: 10,
            rings: 5,
        }),
        ModelSource::Scene(SceneDescription {
            name: "pentagon".into(),
            points: vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [1.5, 0.0, 1.0],
                [0.5, 0.0, 1.5],
                [-0.5, 0.0, 1.0],
            ],
            face_vertex_counts: vec![5],
            face_vertex_indices: vec![0, 1, 2, 3, 4],
            ..Default::default()
        }),
    ];
    for source in &sources {
        let mesh = loader::load(source, &LoaderConfig::default()).expect("load");
        check_invariants(&mesh);
    }
}
