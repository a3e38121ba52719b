#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

pub mod aggregate;
pub mod config;
pub mod data;
pub mod dta;
pub mod faer_ndarray;
pub mod ols;
pub mod pipeline;
pub mod plot;
pub mod randinf;
pub mod randomization;
pub mod rdplot;
pub mod report;
pub mod smooth;
pub mod winselect;
