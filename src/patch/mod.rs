pub mod apply;
pub mod sources;

pub use apply::{PatcherInvocation, PatchError};
pub use sources::{PatchTier, ResolveError, ResolvedArtifacts, SourceResolver};
