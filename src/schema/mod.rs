pub mod packet;
pub mod pending;
pub mod session;
pub mod work;

pub use packet::*;
pub use pending::*;
pub use session::*;
pub use work::*;
