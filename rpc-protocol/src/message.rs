//! Protocol messages exchanged between two vats.
//!
//! Ids are scoped to the side that allocated them: a `question_id` chosen by
//! the caller is the `answer_id` on the callee, an export id on one side is
//! the import id on the other.

use serde::Deserialize;
use serde::Serialize;

use crate::value::Value;

pub type QuestionId = u32;
pub type AnswerId = u32;
pub type ExportId = u32;
pub type ImportId = u32;
pub type EmbargoId = u32;

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// One protocol message. Each transport frame carries exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Message {
    /// Echo of a message the sender did not understand.
    Unimplemented(Box<Message>),
    /// The sender is closing the connection because of an error.
    Abort(Exception),
    Bootstrap(Bootstrap),
    Call(Call),
    Return(Return),
    Finish(Finish),
    Resolve(Resolve),
    Release(Release),
    Disembargo(Disembargo),
    /// Three-party handoff messages. They are carried opaquely so they can be
    /// echoed back as `Unimplemented`.
    Provide(serde_json::Value),
    Accept(serde_json::Value),
    Join(serde_json::Value),
    /// Any variant this implementation does not know, kept verbatim so it can
    /// be echoed back as `Unimplemented`.
    #[serde(untagged)]
    Unknown(serde_json::Value),
}

impl Message {
    /// Tags of every variant this implementation decodes.
    pub const KNOWN_TAGS: &'static [&'static str] = &[
        "unimplemented",
        "abort",
        "bootstrap",
        "call",
        "return",
        "finish",
        "resolve",
        "release",
        "disembargo",
        "provide",
        "accept",
        "join",
    ];

    /// Short lowercase name of the variant, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Unimplemented(_) => "unimplemented",
            Message::Abort(_) => "abort",
            Message::Bootstrap(_) => "bootstrap",
            Message::Call(_) => "call",
            Message::Return(_) => "return",
            Message::Finish(_) => "finish",
            Message::Resolve(_) => "resolve",
            Message::Release(_) => "release",
            Message::Disembargo(_) => "disembargo",
            Message::Provide(_) => "provide",
            Message::Accept(_) => "accept",
            Message::Join(_) => "join",
            Message::Unknown(_) => "unknown",
        }
    }
}

/// The tag of a raw externally tagged message: its single object key.
pub fn raw_tag(raw: &serde_json::Value) -> Option<&str> {
    match raw.as_object() {
        Some(object) if object.len() == 1 => object.keys().next().map(String::as_str),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Calls
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bootstrap {
    pub question_id: QuestionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub question_id: QuestionId,
    pub target: MessageTarget,
    pub interface_id: u64,
    pub method_id: u16,
    pub params: Payload,
    #[serde(default)]
    pub send_results_to: SendResultsTo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendResultsTo {
    /// Send the results back in a `Return`.
    #[default]
    Caller,
    /// Keep the results; a later `Return::TakeFromOtherQuestion` will claim them.
    Yourself,
    ThirdParty(serde_json::Value),
}

/// The object a `Call` or `Disembargo` is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageTarget {
    /// An export of the receiver.
    ImportedCap(ExportId),
    /// A capability inside the results of an unfinished question.
    PromisedAnswer(PromisedAnswer),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PromisedAnswer {
    pub question_id: QuestionId,
    #[serde(default)]
    pub transform: Vec<PipelineOp>,
}

/// One step of a pipeline transform path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineOp {
    Noop,
    GetPointerField(u16),
}

/// Message content plus the capabilities it references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub content: Value,
    #[serde(default)]
    pub cap_table: Vec<CapDescriptor>,
}

/// How a capability is named on the wire, from the sender's point of view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapDescriptor {
    None,
    SenderHosted(ExportId),
    SenderPromise(ExportId),
    ReceiverHosted(ImportId),
    ReceiverAnswer(PromisedAnswer),
    ThirdPartyHosted(serde_json::Value),
}

// ─────────────────────────────────────────────────────────────────────────────
// Completion
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Return {
    pub answer_id: AnswerId,
    #[serde(default = "default_true")]
    pub release_param_caps: bool,
    pub body: ReturnBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnBody {
    Results(Payload),
    Exception(Exception),
    Canceled,
    ResultsSentElsewhere,
    TakeFromOtherQuestion(QuestionId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finish {
    pub question_id: QuestionId,
    #[serde(default = "default_true")]
    pub release_result_caps: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Capability bookkeeping
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolve {
    pub promise_id: ExportId,
    pub body: ResolveBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveBody {
    Cap(CapDescriptor),
    Exception(Exception),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: ImportId,
    pub reference_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disembargo {
    pub target: MessageTarget,
    pub context: DisembargoContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisembargoContext {
    SenderLoopback(EmbargoId),
    ReceiverLoopback(EmbargoId),
    Accept,
    Provide(QuestionId),
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    pub reason: String,
    #[serde(rename = "type", default)]
    pub kind: ExceptionType,
}

impl Exception {
    pub fn new(kind: ExceptionType, reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionType {
    #[default]
    Failed,
    Overloaded,
    Disconnected,
    Unimplemented,
}

fn default_true() -> bool {
    true
}
