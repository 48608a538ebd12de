pub mod instance;
pub mod device;
pub mod objects;
pub mod kernel;
pub mod shader;
pub mod util;
pub mod window;

pub use util::id::UUID;

pub mod prelude {
    pub type Vec2u32 = nalgebra::Vector2<u32>;

    pub use crate::instance::instance::InstanceContext;
    pub use crate::device::device::DeviceContext;
}
