//! Return Channel Frames: the good frames of one master or virtual channel.
use super::{FrameAdmission, ReceivedFrame};
use crate::frame::{FrameQuality, Gvcid, TransferFrameHeader};
use crate::pdu::{
    ParameterName, ParameterValue, RequestedFrameFilter, StartDiagnostic, TransferDataInvocation,
};
use crate::ServiceType;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RcfAdmission {
    permitted: Vec<Gvcid>,
    requested: Option<Gvcid>,
}

impl RcfAdmission {
    pub fn new(permitted: Vec<Gvcid>) -> Self {
        Self {
            permitted,
            requested: None,
        }
    }

    #[inline]
    pub fn requested(&self) -> Option<Gvcid> {
        self.requested
    }
}

impl FrameAdmission for RcfAdmission {
    fn service_type(&self) -> ServiceType {
        ServiceType::Rcf
    }

    fn configure(&mut self, filter: &RequestedFrameFilter) -> Result<(), StartDiagnostic> {
        let RequestedFrameFilter::Rcf(gvcid) = filter else {
            return Err(StartDiagnostic::UnableToComply);
        };
        if !gvcid.is_valid() || !self.permitted.contains(gvcid) {
            return Err(StartDiagnostic::InvalidGvcid);
        }
        self.requested = Some(*gvcid);
        Ok(())
    }

    fn clear(&mut self) {
        self.requested = None;
    }

    fn admit(&mut self, frame: &ReceivedFrame) -> bool {
        let Some(requested) = self.requested else {
            return false;
        };
        if frame.quality != FrameQuality::Good {
            return false;
        }
        match TransferFrameHeader::from_bytes(&frame.data) {
            Ok(header) => requested.matches(&header),
            Err(error) => {
                trace!(%error, "frame without valid primary header");
                false
            }
        }
    }

    fn build_entry(&self, frame: &ReceivedFrame) -> TransferDataInvocation {
        frame.to_transfer_data(frame.data.clone())
    }

    fn parameter(&self, name: ParameterName) -> Option<ParameterValue> {
        match name {
            ParameterName::PermittedGvcidSet => {
                Some(ParameterValue::PermittedGvcidSet(self.permitted.clone()))
            }
            ParameterName::RequestedGvcid => Some(ParameterValue::RequestedGvcid(self.requested)),
            _ => None,
        }
    }
}
