pub mod seat_map;
pub mod allocator;
pub mod status;
pub mod audit;
pub mod seed;
