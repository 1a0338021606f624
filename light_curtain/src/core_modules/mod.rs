pub mod background_cache;
pub mod contour_analyzer;
pub mod frame;
pub mod interlock;
pub mod refresh_policy;
pub mod segmentation;
pub mod state_machine;
pub mod vision_ops;
