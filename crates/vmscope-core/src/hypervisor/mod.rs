//! Component B: Hypervisor Query.

mod qmp;

pub use qmp::{query_kernel_pgd, QmpClient};
