pub mod board;
pub mod state;

pub use board::{AnnotationBoard, Settlement};
pub use state::{AnnotationState, ItemAnnotation, TransitionError};
