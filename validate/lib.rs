#![deny(dead_code)]
#![deny(unused_imports)]

pub mod basis;
pub mod bootstrap;
pub mod calibration;
pub mod compare;
pub mod config;
pub mod data;
pub mod discrimination;
pub mod faer_ndarray;
pub mod impute;
pub mod irls;
pub mod model;
pub mod net_benefit;
pub mod pipeline;
pub mod progress;
pub mod report;
