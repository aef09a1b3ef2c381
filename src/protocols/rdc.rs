//! Radio duty-cycling layer.
//!
//! This simulator models an always-on radio, so the RDC is the null
//! variant: a pass-through that mediates CCA before handing frames to the
//! PHY. Data frames get a clear-channel check and are bounced back to the
//! MAC when the channel is busy; ACK frames are sent immediately, the
//! turnaround slot is theirs by protocol.

use crate::protocols::packets::MacFrame;
use crate::protocols::phy::PhyLayer;
use crate::simulation::SimCtx;

/// Result of handing a frame to the RDC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdcSend {
    /// The frame went to the PHY and is being transmitted.
    Sent,
    /// CCA found the channel busy; the MAC must back off and retry.
    ChannelBusy,
}

pub struct NullRdc;

impl NullRdc {
    pub fn new() -> Self {
        NullRdc
    }

    /// Forward `frame` to the PHY, running CCA first for data frames.
    pub fn send(&self, ctx: &mut SimCtx, phy: &mut PhyLayer, frame: MacFrame) -> RdcSend {
        match &frame {
            MacFrame::Data(_) => {
                if phy.cca(ctx) {
                    RdcSend::ChannelBusy
                } else {
                    phy.send(ctx, frame);
                    RdcSend::Sent
                }
            }
            MacFrame::Ack(_) => {
                phy.send(ctx, frame);
                RdcSend::Sent
            }
        }
    }

    pub fn is_radio_busy(&self, phy: &PhyLayer) -> bool {
        phy.is_radio_busy()
    }
}

impl Default for NullRdc {
    fn default() -> Self {
        Self::new()
    }
}
