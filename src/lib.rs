#![forbid(unsafe_code)]

//! # intent-harness
//!
//! Put free-text questions into a fixed intent taxonomy with an LLM, then
//! measure how often it agrees with ground truth.
//!
//! The model is asked for a ranked list of `label-N:` lines. Each candidate
//! is reconciled against the taxonomy with a Ratcliff/Obershelp similarity
//! score; candidates under the acceptance threshold are kept as
//! `unmatched:<text>` so they can be inspected rather than silently dropped.
//! Batches run through a bounded concurrent dispatcher that stops on the
//! first provider failure unless told to continue.
//!
//! Evaluation subsets are drawn with a proportional stratified sampler so
//! each ground-truth label keeps its share of the source data.

pub mod classifier;
pub mod config;
pub mod dispatch;
pub mod evaluator;
pub mod gateway;
pub mod parser;
pub mod prompts;
pub mod records;
pub mod sampler;
pub mod taxonomy;

pub use classifier::{Classification, Classifier, ClassifierConfig, Classify, ClassifyError};
pub use config::{AppConfig, ConfigError, TaxonomySource};
pub use dispatch::{
    dispatch_all, DispatchConfig, DispatchError, DispatchOutcome, DispatchReport, FailurePolicy,
};
pub use evaluator::{render_report_markdown, EvaluationRecord, EvaluationStats, Evaluator};
pub use gateway::{Attribution, ChatGateway, ProviderError, ProviderGateway, UsageSink};
pub use parser::{parse_reply, ParsedReply};
pub use records::{ClassificationRequest, InputTable, RecordsError, SuccessFilter};
pub use sampler::{stratified_sample, Stratified};
pub use taxonomy::{MatchProfile, ResolvedLabel, Taxonomy, TaxonomyError};
