//! PnP and power dispatch for the two filter roles.
//!
//! Requests the filter acts on are handled here; everything else goes
//! straight to the next driver down. When a request must complete below
//! before the filter can act, the calling thread blocks on a
//! [`CompletionEvent`] until the lower driver signals it, so callers always
//! see a synchronous result.

use alloc::boxed::Box;
use alloc::sync::Arc;

use agplib_abi::{AgpError, AgpResult};
use agplib_lib::{CompletionEvent, klog_debug, klog_warn};

use crate::interface::AgpBusInterface;
use crate::master::{MasterContext, ProcessorBroadcast};
use crate::resource::{CmResourceList, IoResourceRequirementsList, StartDisposition};
use crate::target::{SystemPower, TargetContext};

pub enum PnpRequest {
    FilterRequirements(IoResourceRequirementsList),
    Start(CmResourceList),
    QueryStop,
    CancelStop,
    Stop,
    QueryRemove,
    CancelRemove,
    Remove,
    SurpriseRemoval,
    QueryInterface { version: u16, size: usize },
    SetPower(SystemPower),
    /// Minor function the filter does not look at.
    Other(u8),
}

pub enum PnpReply {
    Done,
    Requirements(IoResourceRequirementsList),
    Interface(AgpBusInterface),
}

pub type PnpOutcome = AgpResult<PnpReply>;

/// The next driver down the stack. It may complete on any thread, at any
/// later time, by signalling `done`.
pub trait LowerDevice: Send + Sync {
    fn submit(&self, request: PnpRequest, done: Arc<CompletionEvent<PnpOutcome>>);
}

/// Send `request` down and block until it completes.
pub fn forward_and_wait(lower: &dyn LowerDevice, request: PnpRequest) -> PnpOutcome {
    let done = Arc::new(CompletionEvent::new());
    lower.submit(request, done.clone());
    done.wait()
}

// =============================================================================
// Target
// =============================================================================

pub struct TargetDispatch {
    target: Arc<TargetContext>,
    lower: Box<dyn LowerDevice>,
}

impl TargetDispatch {
    pub fn new(target: Arc<TargetContext>, lower: Box<dyn LowerDevice>) -> Self {
        Self { target, lower }
    }

    pub fn target(&self) -> &Arc<TargetContext> {
        &self.target
    }

    pub fn dispatch(&self, request: PnpRequest) -> PnpOutcome {
        match request {
            PnpRequest::FilterRequirements(list) => {
                // The bus fills the list in first.
                let mut list = match forward_and_wait(&*self.lower, PnpRequest::FilterRequirements(list))? {
                    PnpReply::Requirements(list) => list,
                    _ => return Err(AgpError::Unsuccessful),
                };
                self.target.filter_requirements(&mut list)?;
                Ok(PnpReply::Requirements(list))
            }
            PnpRequest::Start(resources) => match self.target.start(resources) {
                StartDisposition::Forward { resources, status } => {
                    forward_and_wait(&*self.lower, PnpRequest::Start(resources))?;
                    status.map(|()| PnpReply::Done)
                }
                StartDisposition::Complete(err) => {
                    klog_warn!("agp: target start failed: {}", err);
                    Err(err)
                }
            },
            PnpRequest::Stop | PnpRequest::Remove | PnpRequest::SurpriseRemoval => {
                self.target.stop();
                forward_and_wait(&*self.lower, request)
            }
            PnpRequest::SetPower(power) => {
                self.target.system_power_changed(power);
                forward_and_wait(&*self.lower, request)
            }
            other => forward_and_wait(&*self.lower, other),
        }
    }
}

// =============================================================================
// Master
// =============================================================================

pub struct MasterDispatch {
    master: Arc<MasterContext>,
    lower: Box<dyn LowerDevice>,
    processors: Box<dyn ProcessorBroadcast + Send + Sync>,
}

impl MasterDispatch {
    pub fn new(
        master: Arc<MasterContext>,
        lower: Box<dyn LowerDevice>,
        processors: Box<dyn ProcessorBroadcast + Send + Sync>,
    ) -> Self {
        Self {
            master,
            lower,
            processors,
        }
    }

    pub fn master(&self) -> &Arc<MasterContext> {
        &self.master
    }

    pub fn dispatch(&self, request: PnpRequest) -> PnpOutcome {
        match request {
            PnpRequest::QueryInterface { version, size } => self
                .master
                .query_interface(version, size)
                .map(PnpReply::Interface),
            PnpRequest::Start(resources) => {
                forward_and_wait(&*self.lower, PnpRequest::Start(resources))?;
                self.master.start(&*self.processors)?;
                Ok(PnpReply::Done)
            }
            PnpRequest::QueryStop => {
                self.master.query_stop()?;
                let outcome = forward_and_wait(&*self.lower, PnpRequest::QueryStop);
                if outcome.is_err() {
                    self.master.cancel_stop();
                }
                outcome
            }
            PnpRequest::CancelStop => {
                self.master.cancel_stop();
                forward_and_wait(&*self.lower, PnpRequest::CancelStop)
            }
            PnpRequest::QueryRemove => {
                self.master.query_remove()?;
                let outcome = forward_and_wait(&*self.lower, PnpRequest::QueryRemove);
                if outcome.is_err() {
                    self.master.cancel_remove();
                }
                outcome
            }
            PnpRequest::CancelRemove => {
                self.master.cancel_remove();
                forward_and_wait(&*self.lower, PnpRequest::CancelRemove)
            }
            // A stop or remove without the query still needs a quiet master.
            request @ (PnpRequest::Stop | PnpRequest::Remove) => {
                self.master.check_quiesced()?;
                forward_and_wait(&*self.lower, request)
            }
            other => {
                klog_debug!("agp: master passing request down");
                forward_and_wait(&*self.lower, other)
            }
        }
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
