//! A recording PHY for tests: captures everything the engine writes back so
//! scenarios can assert on exact bytes, stalls and acks.

use crate::phy::{EndpointInit, PhyIo};
use crate::Result;

#[derive(Default)]
pub struct MockPhy {
    /// Every `send_on_endpoint` call, in order.
    pub sent: Vec<(u8, Vec<u8>)>,
    pub stalls: usize,
    pub acks: usize,
    /// Endpoint sets received through `configure_endpoints`.
    pub configured: Vec<Vec<EndpointInit>>,
}

impl MockPhy {
    pub fn new() -> Self {
        Self::default()
    }

    /// The responses written to endpoint 0.
    pub fn ep0_responses(&self) -> Vec<&[u8]> {
        self.sent
            .iter()
            .filter(|(ep, _)| *ep == 0)
            .map(|(_, data)| data.as_slice())
            .collect()
    }

    pub fn last_ep0(&self) -> Option<&[u8]> {
        self.ep0_responses().last().copied()
    }
}

impl PhyIo for MockPhy {
    fn send_on_endpoint(&mut self, ep_num: u8, data: &[u8]) -> Result<()> {
        self.sent.push((ep_num, data.to_vec()));
        Ok(())
    }

    fn stall_ep0(&mut self) -> Result<()> {
        self.stalls += 1;
        Ok(())
    }

    fn ack_status_stage(&mut self) -> Result<()> {
        self.acks += 1;
        Ok(())
    }

    fn configure_endpoints(&mut self, endpoints: &[EndpointInit]) -> Result<()> {
        self.configured.push(endpoints.to_vec());
        Ok(())
    }
}
