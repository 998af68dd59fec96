//! Aggregated machine state used by snapshots and determinism tests.

use crate::acia::{AciaState, IkbdState};
use crate::cpu::CpuState;
use crate::fdc::DmaFdcState;
use crate::glue::GlueState;
use crate::mfp::MfpState;
use crate::psg::PsgState;
use crate::shifter::ShifterState;
use serde::{Deserialize, Serialize};

/// Every component's serializable block plus the RAM image.
///
/// The snapshot engine persists the blocks individually in step order;
/// this struct is the in-memory rendezvous for both directions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MachineState {
    pub cpu: CpuState,
    pub glue: GlueState,
    pub shifter: ShifterState,
    pub mfp: MfpState,
    pub psg: PsgState,
    pub acia_keyboard: AciaState,
    pub acia_midi: AciaState,
    pub ikbd: IkbdState,
    pub dma: DmaFdcState,
    #[serde(skip)]
    pub ram: Vec<u8>,
}
