pub mod seat;
pub mod registration;

pub use seat::{SeatId, SeatIdError};
pub use registration::{NewRegistration, Registration};
