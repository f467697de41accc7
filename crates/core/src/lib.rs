pub mod constpool;
pub mod decoder;
pub mod encoder;
pub mod frames;
pub mod model;
pub mod opcode;

pub use constpool::{ConstEntry, ConstPool};
pub use decoder::decode;
pub use encoder::encode;
pub use model::{ClassModel, Insn, Label, Member, MethodBody};
