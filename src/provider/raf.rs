//! Return All Frames: every frame of the physical channel, filtered by its quality.
use super::{FrameAdmission, ReceivedFrame};
use crate::pdu::{
    ParameterName, ParameterValue, RequestedFrameFilter, RequestedFrameQuality, StartDiagnostic,
    TransferDataInvocation,
};
use crate::ServiceType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RafAdmission {
    permitted: Vec<RequestedFrameQuality>,
    requested: Option<RequestedFrameQuality>,
}

impl RafAdmission {
    pub fn new(permitted: Vec<RequestedFrameQuality>) -> Self {
        Self {
            permitted,
            requested: None,
        }
    }

    #[inline]
    pub fn requested(&self) -> Option<RequestedFrameQuality> {
        self.requested
    }
}

impl FrameAdmission for RafAdmission {
    fn service_type(&self) -> ServiceType {
        ServiceType::Raf
    }

    fn configure(&mut self, filter: &RequestedFrameFilter) -> Result<(), StartDiagnostic> {
        let RequestedFrameFilter::Raf(quality) = filter else {
            return Err(StartDiagnostic::UnableToComply);
        };
        if !self.permitted.contains(quality) {
            return Err(StartDiagnostic::InvalidFrameQuality);
        }
        self.requested = Some(*quality);
        Ok(())
    }

    fn clear(&mut self) {
        self.requested = None;
    }

    fn admit(&mut self, frame: &ReceivedFrame) -> bool {
        self.requested
            .is_some_and(|requested| requested.accepts(frame.quality))
    }

    fn build_entry(&self, frame: &ReceivedFrame) -> TransferDataInvocation {
        let mut entry = frame.to_transfer_data(frame.data.clone());
        entry.delivered_frame_quality = Some(frame.quality);
        entry
    }

    fn parameter(&self, name: ParameterName) -> Option<ParameterValue> {
        match name {
            ParameterName::PermittedFrameQuality => {
                Some(ParameterValue::PermittedFrameQuality(self.permitted.clone()))
            }
            ParameterName::RequestedFrameQuality => {
                Some(ParameterValue::RequestedFrameQuality(self.requested))
            }
            _ => None,
        }
    }
}
