//! Return Operational Control Field: the OCFs carried by the good frames of one channel.
//!
//! Only the four OCF octets are delivered. In the change based update mode an OCF is only
//! delivered if it differs from the last delivered OCF of the same telecommand virtual
//! channel. OCFs which are not CLCWs share one slot. An OCF counts as delivered once its
//! transfer buffer was handed over for transmission, a discarded buffer does not count.
use super::{FrameAdmission, ReceivedFrame};
use crate::frame::{FrameQuality, Gvcid, Ocf, TransferFrameHeader};
use crate::pdu::{
    ControlWordType, ParameterName, ParameterValue, RequestedFrameFilter, RocfFilter,
    StartDiagnostic, TransferDataInvocation, UpdateMode,
};
use crate::ServiceType;
use std::collections::HashMap;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RocfAdmission {
    permitted_gvcids: Vec<Gvcid>,
    permitted_tc_vcids: Vec<u8>,
    permitted_control_word_types: Vec<ControlWordType>,
    permitted_update_modes: Vec<UpdateMode>,
    requested: Option<RocfFilter>,
    last_delivered: HashMap<Option<u8>, Ocf>,
    /// [Self::last_delivered] updated by the OCFs of the buffer under construction.
    last_buffered: HashMap<Option<u8>, Ocf>,
}

impl RocfAdmission {
    pub fn new(
        permitted_gvcids: Vec<Gvcid>,
        permitted_tc_vcids: Vec<u8>,
        permitted_control_word_types: Vec<ControlWordType>,
        permitted_update_modes: Vec<UpdateMode>,
    ) -> Self {
        Self {
            permitted_gvcids,
            permitted_tc_vcids,
            permitted_control_word_types,
            permitted_update_modes,
            requested: None,
            last_delivered: HashMap::new(),
            last_buffered: HashMap::new(),
        }
    }

    #[inline]
    pub fn requested(&self) -> Option<&RocfFilter> {
        self.requested.as_ref()
    }

    fn validate(&self, filter: &RocfFilter) -> Result<(), StartDiagnostic> {
        if !filter.gvcid.is_valid() || !self.permitted_gvcids.contains(&filter.gvcid) {
            return Err(StartDiagnostic::InvalidGvcid);
        }
        if !self
            .permitted_control_word_types
            .contains(&filter.control_word_type)
        {
            return Err(StartDiagnostic::InvalidControlWordType);
        }
        match (filter.control_word_type, filter.tc_vcid) {
            (ControlWordType::Clcw, Some(tc_vcid)) if !self.permitted_tc_vcids.contains(&tc_vcid) => {
                return Err(StartDiagnostic::InvalidTcVcid)
            }
            // A TC virtual channel can only be selected among CLCWs.
            (ControlWordType::All | ControlWordType::NotClcw, Some(_)) => {
                return Err(StartDiagnostic::InvalidTcVcid)
            }
            _ => (),
        }
        if !self.permitted_update_modes.contains(&filter.update_mode) {
            return Err(StartDiagnostic::InvalidUpdateMode);
        }
        Ok(())
    }

    fn selected_ocf(filter: &RocfFilter, frame: &ReceivedFrame) -> Option<Ocf> {
        if frame.quality != FrameQuality::Good {
            return None;
        }
        let header = match TransferFrameHeader::from_bytes(&frame.data) {
            Ok(header) => header,
            Err(error) => {
                trace!(%error, "frame without valid primary header");
                return None;
            }
        };
        // AOS frames do not flag the OCF, its presence is a property of the channel.
        if !filter.gvcid.matches(&header) || header.ocf_flag() == Some(false) {
            return None;
        }
        let ocf = Ocf::from_frame(&frame.data)?;
        let type_selected = match filter.control_word_type {
            ControlWordType::All => true,
            ControlWordType::Clcw => ocf.is_clcw(),
            ControlWordType::NotClcw => !ocf.is_clcw(),
        };
        if !type_selected {
            return None;
        }
        match filter.tc_vcid {
            Some(tc_vcid) if ocf.clcw_virtual_channel_id() != Some(tc_vcid) => None,
            _ => Some(ocf),
        }
    }
}

impl FrameAdmission for RocfAdmission {
    fn service_type(&self) -> ServiceType {
        ServiceType::Rocf
    }

    fn configure(&mut self, filter: &RequestedFrameFilter) -> Result<(), StartDiagnostic> {
        let RequestedFrameFilter::Rocf(filter) = filter else {
            return Err(StartDiagnostic::UnableToComply);
        };
        self.validate(filter)?;
        self.requested = Some(*filter);
        self.last_delivered.clear();
        self.last_buffered.clear();
        Ok(())
    }

    fn clear(&mut self) {
        self.requested = None;
        self.last_delivered.clear();
        self.last_buffered.clear();
    }

    fn admit(&mut self, frame: &ReceivedFrame) -> bool {
        let Some(filter) = self.requested else {
            return false;
        };
        let Some(ocf) = Self::selected_ocf(&filter, frame) else {
            return false;
        };
        match filter.update_mode {
            UpdateMode::Continuous => true,
            UpdateMode::ChangeBased => {
                let slot = ocf.clcw_virtual_channel_id();
                if self.last_buffered.get(&slot) == Some(&ocf) {
                    return false;
                }
                self.last_buffered.insert(slot, ocf);
                true
            }
        }
    }

    fn build_entry(&self, frame: &ReceivedFrame) -> TransferDataInvocation {
        let data = Ocf::from_frame(&frame.data)
            .map(|ocf| ocf.to_be_bytes().to_vec())
            .unwrap_or_default();
        frame.to_transfer_data(data)
    }

    fn buffer_handed_over(&mut self) {
        self.last_delivered.clone_from(&self.last_buffered);
    }

    fn buffer_discarded(&mut self) {
        self.last_buffered.clone_from(&self.last_delivered);
    }

    fn parameter(&self, name: ParameterName) -> Option<ParameterValue> {
        let requested = self.requested.as_ref();
        let value = match name {
            ParameterName::PermittedGvcidSet => {
                ParameterValue::PermittedGvcidSet(self.permitted_gvcids.clone())
            }
            ParameterName::PermittedTcVcidSet => {
                ParameterValue::PermittedTcVcidSet(self.permitted_tc_vcids.clone())
            }
            ParameterName::PermittedControlWordTypeSet => ParameterValue::PermittedControlWordTypeSet(
                self.permitted_control_word_types.clone(),
            ),
            ParameterName::PermittedUpdateModeSet => {
                ParameterValue::PermittedUpdateModeSet(self.permitted_update_modes.clone())
            }
            ParameterName::RequestedGvcid => {
                ParameterValue::RequestedGvcid(requested.map(|filter| filter.gvcid))
            }
            ParameterName::RequestedTcVcid => {
                ParameterValue::RequestedTcVcid(requested.and_then(|filter| filter.tc_vcid))
            }
            ParameterName::RequestedControlWordType => ParameterValue::RequestedControlWordType(
                requested.map(|filter| filter.control_word_type),
            ),
            ParameterName::RequestedUpdateMode => {
                ParameterValue::RequestedUpdateMode(requested.map(|filter| filter.update_mode))
            }
            _ => return None,
        };
        Some(value)
    }
}
