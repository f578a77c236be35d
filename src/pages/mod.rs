pub mod assemble;
pub mod boundary;
pub mod judge;
pub mod pipeline;
pub mod reconcile;
pub mod selection;
pub mod window;


pub use assemble::{PageDiagnostic, ReportParser};
pub use boundary::BoundaryParser;
pub use judge::{OpenAiJudge, ScoredOptions};
pub use pipeline::{CombineOutcome, RawSource, combine_by_rule, combine_scored};
pub use reconcile::Decisions;
pub use selection::{RangeSelector, SelectionRules, render_filtered};
pub use window::{Chunk, window};
