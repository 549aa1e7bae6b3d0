//! faceid-core: Face enrollment and verification engine.
//!
//! Matches extractor-produced face descriptors against stored per-identity
//! templates by Euclidean distance. The extractor itself is an external
//! collaborator behind the [`Extractor`] trait.

pub mod enrollment;
pub mod extractor;
pub mod matcher;
pub mod store;
pub mod types;
pub mod verification;

pub use enrollment::{enroll, EnrollError, EnrollProgress, EnrollmentSession, Registered};
pub use extractor::{Extractor, ExtractorError};
pub use matcher::{match_tick, BestMatch, EuclideanMatcher, Gallery, MatchError, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use store::{KeyValue, MemoryKv, SqliteKv, StoreError, TemplateStore};
pub use types::{BoundingBox, Descriptor, DetectedFace, DetectionTick, Identity, Label, MatchResult};
pub use verification::{Decision, GalleryScope, PassWindow, VerificationUpdate, Verifier, VerifyError};
