//! One-line human readable summaries of protocol messages for tracing.

use std::fmt;

use crate::message::CapDescriptor;
use crate::message::DisembargoContext;
use crate::message::Message;
use crate::message::MessageTarget;
use crate::message::PipelineOp;
use crate::message::ResolveBody;
use crate::message::ReturnBody;
use crate::message::SendResultsTo;
use crate::message::raw_tag;

/// `Display` adapter: `tracing::debug!("> {}", MessageDump(&message))`.
pub struct MessageDump<'a>(pub &'a Message);

impl fmt::Display for MessageDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Message::Unimplemented(inner) => {
                write!(f, "unimplemented({})", MessageDump(inner))
            }
            Message::Abort(exception) => {
                write!(f, "abort {:?}: {}", exception.kind, exception.reason)
            }
            Message::Bootstrap(bootstrap) => write!(f, "bootstrap q={}", bootstrap.question_id),
            Message::Call(call) => {
                write!(
                    f,
                    "call q={} target={} 0x{:x}.method#{} caps=[{}]",
                    call.question_id,
                    Target(&call.target),
                    call.interface_id,
                    call.method_id,
                    Caps(&call.params.cap_table),
                )?;
                match call.send_results_to {
                    SendResultsTo::Caller => Ok(()),
                    SendResultsTo::Yourself => write!(f, " send_results_to=yourself"),
                    SendResultsTo::ThirdParty(_) => write!(f, " send_results_to=third_party"),
                }
            }
            Message::Return(ret) => {
                write!(f, "return a={} ", ret.answer_id)?;
                match &ret.body {
                    ReturnBody::Results(payload) => {
                        write!(f, "results caps=[{}]", Caps(&payload.cap_table))
                    }
                    ReturnBody::Exception(exception) => {
                        write!(f, "exception {:?}: {}", exception.kind, exception.reason)
                    }
                    ReturnBody::Canceled => write!(f, "canceled"),
                    ReturnBody::ResultsSentElsewhere => write!(f, "results_sent_elsewhere"),
                    ReturnBody::TakeFromOtherQuestion(id) => {
                        write!(f, "take_from_other_question={id}")
                    }
                }
            }
            Message::Finish(finish) => write!(
                f,
                "finish q={} release_result_caps={}",
                finish.question_id, finish.release_result_caps
            ),
            Message::Resolve(resolve) => match &resolve.body {
                ResolveBody::Cap(cap) => {
                    write!(f, "resolve promise={} cap={}", resolve.promise_id, Cap(cap))
                }
                ResolveBody::Exception(exception) => write!(
                    f,
                    "resolve promise={} exception {:?}: {}",
                    resolve.promise_id, exception.kind, exception.reason
                ),
            },
            Message::Release(release) => write!(
                f,
                "release id={} count={}",
                release.id, release.reference_count
            ),
            Message::Disembargo(disembargo) => {
                write!(f, "disembargo target={} ", Target(&disembargo.target))?;
                match &disembargo.context {
                    DisembargoContext::SenderLoopback(id) => write!(f, "sender_loopback={id}"),
                    DisembargoContext::ReceiverLoopback(id) => {
                        write!(f, "receiver_loopback={id}")
                    }
                    DisembargoContext::Accept => write!(f, "accept"),
                    DisembargoContext::Provide(id) => write!(f, "provide={id}"),
                }
            }
            Message::Unknown(raw) => match raw_tag(raw) {
                Some(tag) => write!(f, "unknown {tag}"),
                None => write!(f, "unknown"),
            },
            other => write!(f, "{}", other.kind()),
        }
    }
}

struct Target<'a>(&'a MessageTarget);

impl fmt::Display for Target<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            MessageTarget::ImportedCap(id) => write!(f, "import#{id}"),
            MessageTarget::PromisedAnswer(answer) => {
                write!(f, "answer#{}{}", answer.question_id, Ops(&answer.transform))
            }
        }
    }
}

struct Ops<'a>(&'a [PipelineOp]);

impl fmt::Display for Ops<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for op in self.0 {
            match op {
                PipelineOp::Noop => {}
                PipelineOp::GetPointerField(index) => write!(f, ".{index}")?,
            }
        }
        Ok(())
    }
}

struct Cap<'a>(&'a CapDescriptor);

impl fmt::Display for Cap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            CapDescriptor::None => write!(f, "none"),
            CapDescriptor::SenderHosted(id) => write!(f, "sender_hosted({id})"),
            CapDescriptor::SenderPromise(id) => write!(f, "sender_promise({id})"),
            CapDescriptor::ReceiverHosted(id) => write!(f, "receiver_hosted({id})"),
            CapDescriptor::ReceiverAnswer(answer) => write!(
                f,
                "receiver_answer({}{})",
                answer.question_id,
                Ops(&answer.transform)
            ),
            CapDescriptor::ThirdPartyHosted(_) => write!(f, "third_party_hosted"),
        }
    }
}

struct Caps<'a>(&'a [CapDescriptor]);

impl fmt::Display for Caps<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, cap) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", Cap(cap))?;
        }
        Ok(())
    }
}
