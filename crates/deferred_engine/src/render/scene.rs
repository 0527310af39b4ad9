//! Scene-facing interfaces consumed by the renderers
//!
//! Renderers never own scene data. Each frame they read the camera and light
//! list through [`SceneView`] and walk the opaque draw list through
//! [`RenderList`]. [`SceneSnapshot`] is plain data implementing both.

use crate::foundation::math::{Mat4, Mat4Ext, Vec3, Vec4};
use crate::render::mesh::Mesh;

/// Light type, stored as a float in the lighting block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightKind {
    /// Parallel rays along `direction`
    Directional,
    /// Cone from `position` along `direction`
    Spot,
    /// Omnidirectional from `position`
    Point,
}

impl LightKind {
    /// Shader-side type code
    pub fn code(self) -> f32 {
        match self {
            Self::Directional => 0.0,
            Self::Spot => 1.0,
            Self::Point => 2.0,
        }
    }
}

/// One active light
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Light {
    /// Linear RGB colour, alpha unused
    pub colour: Vec4,
    /// World position (spot and point lights)
    pub position: Vec3,
    /// Direction (directional and spot lights), normalised when packed
    pub direction: Vec3,
    /// Intensity multiplier
    pub intensity: f32,
    /// Attenuation radius
    pub radius: f32,
    /// Light type
    pub kind: LightKind,
    /// Spot cone angle in radians
    pub angle: f32,
}

impl Light {
    /// Directional light
    pub fn directional(direction: Vec3, colour: Vec3, intensity: f32) -> Self {
        Self {
            colour: colour.push(1.0),
            position: Vec3::zeros(),
            direction,
            intensity,
            radius: 0.0,
            kind: LightKind::Directional,
            angle: 0.0,
        }
    }

    /// Point light
    pub fn point(position: Vec3, colour: Vec3, intensity: f32, radius: f32) -> Self {
        Self {
            position,
            radius,
            kind: LightKind::Point,
            ..Self::directional(Vec3::zeros(), colour, intensity)
        }
    }

    /// Spot light
    pub fn spot(position: Vec3, direction: Vec3, colour: Vec3, intensity: f32, angle: f32) -> Self {
        Self {
            position,
            angle,
            kind: LightKind::Spot,
            ..Self::directional(direction, colour, intensity)
        }
    }
}

/// Camera matrices for one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraData {
    /// Projection matrix
    pub projection: Mat4,
    /// View matrix
    pub view: Mat4,
    /// World position
    pub position: Vec3,
}

impl CameraData {
    /// Perspective camera at `eye` looking at `target`, Y up
    pub fn look_at(eye: Vec3, target: Vec3, fov_y: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self {
            projection: Mat4::perspective(fov_y, aspect, near, far),
            view: Mat4::look_at(eye, target, Vec3::y()),
            position: eye,
        }
    }

    /// Projection times view
    pub fn proj_view(&self) -> Mat4 {
        self.projection * self.view
    }
}

impl Default for CameraData {
    fn default() -> Self {
        Self {
            projection: Mat4::identity(),
            view: Mat4::identity(),
            position: Vec3::zeros(),
        }
    }
}

/// Camera and light queries
pub trait SceneView {
    /// Active camera
    fn camera(&self) -> CameraData;
    /// Active lights
    fn lights(&self) -> &[Light];
}

/// One opaque entity as the render list reports it
#[derive(Debug, Clone, Copy)]
pub struct OpaqueObject<'a> {
    /// Mesh, if the entity has one
    pub mesh: Option<&'a Mesh>,
    /// World transform
    pub world_transform: Mat4,
    /// Texture transform component, if any
    pub texture_matrix: Option<Mat4>,
}

/// Visibility-ordered opaque draw list
pub trait RenderList {
    /// Visit every opaque object in submission order
    fn for_each_opaque<'a>(&'a self, f: &mut dyn FnMut(OpaqueObject<'a>));
}

/// Plain-data scene implementing both queries
#[derive(Debug, Default, Clone)]
pub struct SceneSnapshot<'m> {
    /// Camera
    pub camera: CameraData,
    /// Lights
    pub lights: Vec<Light>,
    /// Opaque objects in draw order
    pub objects: Vec<OpaqueObject<'m>>,
}

impl<'m> SceneSnapshot<'m> {
    /// Empty scene seen through `camera`
    pub fn new(camera: CameraData) -> Self {
        Self {
            camera,
            lights: Vec::new(),
            objects: Vec::new(),
        }
    }

    /// Add a light
    pub fn add_light(&mut self, light: Light) -> &mut Self {
        self.lights.push(light);
        self
    }

    /// Add a mesh at `transform`
    pub fn add_mesh(&mut self, mesh: &'m Mesh, transform: Mat4) -> &mut Self {
        self.objects.push(OpaqueObject {
            mesh: Some(mesh),
            world_transform: transform,
            texture_matrix: None,
        });
        self
    }

    /// Add any object
    pub fn add_object(&mut self, object: OpaqueObject<'m>) -> &mut Self {
        self.objects.push(object);
        self
    }
}

impl SceneView for SceneSnapshot<'_> {
    fn camera(&self) -> CameraData {
        self.camera
    }

    fn lights(&self) -> &[Light] {
        &self.lights
    }
}

impl<'m> RenderList for SceneSnapshot<'m> {
    fn for_each_opaque<'a>(&'a self, f: &mut dyn FnMut(OpaqueObject<'a>)) {
        for object in &self.objects {
            f(*object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_light_constructors() {
        let point = Light::point(Vec3::new(1.0, 2.0, 3.0), Vec3::new(1.0, 0.5, 0.25), 2.0, 10.0);
        assert_eq!(point.kind, LightKind::Point);
        assert_eq!(point.colour, Vec4::new(1.0, 0.5, 0.25, 1.0));
        assert_eq!(point.radius, 10.0);
        assert_eq!(LightKind::Spot.code(), 1.0);
    }

    #[test]
    fn test_snapshot_visits_in_order() {
        let mut scene = SceneSnapshot::new(CameraData::default());
        scene.add_object(OpaqueObject {
            mesh: None,
            world_transform: Mat4::new_translation(&Vec3::new(1.0, 0.0, 0.0)),
            texture_matrix: None,
        });
        scene.add_object(OpaqueObject {
            mesh: None,
            world_transform: Mat4::new_translation(&Vec3::new(2.0, 0.0, 0.0)),
            texture_matrix: Some(Mat4::identity()),
        });

        let mut xs = Vec::new();
        scene.for_each_opaque(&mut |object| xs.push(object.world_transform[(0, 3)]));
        assert_eq!(xs, vec![1.0, 2.0]);
    }
}
