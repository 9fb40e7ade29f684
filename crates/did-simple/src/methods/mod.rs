pub mod key;
pub mod plc;
