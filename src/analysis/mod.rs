pub mod callgraph;
pub mod liveness;
pub mod pointsto;
