pub mod aggregator;
pub mod bus;
pub mod identity;
pub mod live;
pub mod recognition;
pub mod tracker;
