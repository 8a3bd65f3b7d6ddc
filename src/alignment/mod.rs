pub mod engine;
pub mod similarity;

pub use engine::{
    displacement_for, AlignmentEngine, BinarizeMethod, MatchResult, STACK_SIZE,
};
pub use similarity::{similarity, similarity_with_label};
