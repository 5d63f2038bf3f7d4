//! Valve controller: manifold commands with lane mutual exclusion
//!
//! Owns every valve command on the bench. All operations serialize on one
//! internal mutex, and the lane-exclusion rule is applied inside that
//! critical section: opening one of BV-L1/L2/L3 closes any other open lane
//! valve in the same transaction, so no snapshot can ever observe two open
//! lanes.
//!
//! `close_all` shuts every valve and forces the diverter to BYPASS, the
//! bench's safe resting configuration, also used on emergency stop.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::hardware::{BusError, DiverterPos, HardwareBackend, ValveBank, ValveId};
use crate::standards::MeterSize;

struct ValveBook {
    states: BTreeMap<ValveId, bool>,
    diverter: DiverterPos,
    active_lane: Option<ValveId>,
}

/// High-level valve controller. Cheap to clone via `Arc`.
pub struct ValveController {
    backend: Arc<dyn HardwareBackend>,
    book: Mutex<ValveBook>,
}

impl ValveController {
    pub fn new(backend: Arc<dyn HardwareBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            book: Mutex::new(ValveBook {
                states: ValveId::ALL.iter().map(|v| (*v, false)).collect(),
                diverter: DiverterPos::Bypass,
                active_lane: None,
            }),
        })
    }

    /// Open a valve. Lane valves close their siblings first; if a sibling
    /// refuses to close the open is abandoned.
    pub async fn open(&self, valve: ValveId) -> Result<(), BusError> {
        let mut book = self.book.lock().await;
        if valve.is_lane() {
            for lane in ValveId::LANES {
                if lane != valve && book.states.get(&lane).copied().unwrap_or(false) {
                    self.backend.set_valve(lane, false).await?;
                    book.states.insert(lane, false);
                    debug!(valve = %lane, "lane closed for mutual exclusion");
                }
            }
            book.active_lane = Some(valve);
        }
        self.backend.set_valve(valve, true).await?;
        book.states.insert(valve, true);
        debug!(valve = %valve, "valve opened");
        Ok(())
    }

    /// Close a valve.
    pub async fn close(&self, valve: ValveId) -> Result<(), BusError> {
        let mut book = self.book.lock().await;
        if book.active_lane == Some(valve) {
            book.active_lane = None;
        }
        self.backend.set_valve(valve, false).await?;
        book.states.insert(valve, false);
        debug!(valve = %valve, "valve closed");
        Ok(())
    }

    /// Close every valve and force the diverter to BYPASS.
    ///
    /// Best-effort across all valves: a failure on one does not stop the
    /// rest; the first error is returned afterwards.
    pub async fn close_all(&self) -> Result<(), BusError> {
        let mut book = self.book.lock().await;
        let mut first_err = None;
        for valve in ValveId::ALL {
            match self.backend.set_valve(valve, false).await {
                Ok(()) => {
                    book.states.insert(valve, false);
                }
                Err(e) => first_err = first_err.or(Some(e)),
            }
        }
        match self.backend.set_diverter(DiverterPos::Bypass).await {
            Ok(()) => book.diverter = DiverterPos::Bypass,
            Err(e) => first_err = first_err.or(Some(e)),
        }
        book.active_lane = None;
        info!("all valves closed, diverter BYPASS");
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Open the lane valve matching a meter size:
    /// DN25 → BV-L1 (1"), DN20 → BV-L2 (3/4"), DN15 → BV-L3 (1/2").
    pub async fn select_lane(&self, size: MeterSize) -> Result<ValveId, BusError> {
        let lane = lane_for(size);
        self.open(lane).await?;
        info!(size = %size, lane = %lane, "test lane selected");
        Ok(lane)
    }

    /// Move the three-way diverter.
    pub async fn set_diverter(&self, pos: DiverterPos) -> Result<(), BusError> {
        let mut book = self.book.lock().await;
        self.backend.set_diverter(pos).await?;
        book.diverter = pos;
        debug!(position = %pos, "diverter moved");
        Ok(())
    }

    // -------------------------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------------------------

    pub async fn state(&self, valve: ValveId) -> bool {
        self.book.lock().await.states.get(&valve).copied().unwrap_or(false)
    }

    pub async fn diverter(&self) -> DiverterPos {
        self.book.lock().await.diverter
    }

    /// The lane valve most recently opened via the controller, if any.
    pub async fn active_lane(&self) -> Option<ValveId> {
        self.book.lock().await.active_lane
    }

    pub async fn states(&self) -> ValveBank {
        let book = self.book.lock().await;
        ValveBank {
            valves: book.states.clone(),
            diverter: book.diverter,
        }
    }

    /// Whether SV1 or the bypass is open (a pump-safe flow path).
    pub async fn flow_path_open(&self) -> bool {
        let book = self.book.lock().await;
        book.states.get(&ValveId::Sv1).copied().unwrap_or(false)
            || book.states.get(&ValveId::BvBypass).copied().unwrap_or(false)
    }

    pub async fn any_lane_open(&self) -> bool {
        let book = self.book.lock().await;
        ValveId::LANES
            .iter()
            .any(|v| book.states.get(v).copied().unwrap_or(false))
    }
}

/// Lane mapping used by LINE_SELECT.
pub fn lane_for(size: MeterSize) -> ValveId {
    match size {
        MeterSize::Dn25 => ValveId::BvL1,
        MeterSize::Dn20 => ValveId::BvL2,
        MeterSize::Dn15 => ValveId::BvL3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Simulator;

    fn controller() -> (Arc<Simulator>, Arc<ValveController>) {
        let sim = Arc::new(Simulator::new());
        sim.set_noise(false);
        let vc = ValveController::new(sim.clone());
        (sim, vc)
    }

    #[tokio::test]
    async fn opening_a_lane_closes_the_previous_one() {
        let (sim, vc) = controller();
        vc.open(ValveId::BvL1).await.unwrap();
        assert!(vc.state(ValveId::BvL1).await);
        assert_eq!(vc.active_lane().await, Some(ValveId::BvL1));

        vc.open(ValveId::BvL3).await.unwrap();
        assert!(!vc.state(ValveId::BvL1).await);
        assert!(vc.state(ValveId::BvL3).await);
        assert_eq!(vc.active_lane().await, Some(ValveId::BvL3));

        // The physical layer agrees.
        let bank = sim.valve_states().await.unwrap();
        assert!(!bank.is_open(ValveId::BvL1));
        assert!(bank.is_open(ValveId::BvL3));
    }

    #[tokio::test]
    async fn select_lane_maps_sizes() {
        let (_sim, vc) = controller();
        assert_eq!(vc.select_lane(MeterSize::Dn25).await.unwrap(), ValveId::BvL1);
        assert_eq!(vc.select_lane(MeterSize::Dn20).await.unwrap(), ValveId::BvL2);
        assert_eq!(vc.select_lane(MeterSize::Dn15).await.unwrap(), ValveId::BvL3);
        assert!(vc.state(ValveId::BvL3).await);
        assert!(!vc.state(ValveId::BvL1).await);
    }

    #[tokio::test]
    async fn close_all_resets_manifold() {
        let (sim, vc) = controller();
        vc.open(ValveId::Sv1).await.unwrap();
        vc.open(ValveId::BvL2).await.unwrap();
        vc.set_diverter(DiverterPos::Collect).await.unwrap();

        vc.close_all().await.unwrap();
        for valve in ValveId::ALL {
            assert!(!vc.state(valve).await);
        }
        assert_eq!(vc.diverter().await, DiverterPos::Bypass);
        assert_eq!(vc.active_lane().await, None);

        let bank = sim.valve_states().await.unwrap();
        assert!(ValveId::ALL.iter().all(|v| !bank.is_open(*v)));
        assert_eq!(bank.diverter, DiverterPos::Bypass);
    }

    #[tokio::test]
    async fn flow_path_tracks_sv1_and_bypass() {
        let (_sim, vc) = controller();
        assert!(!vc.flow_path_open().await);
        vc.open(ValveId::BvBypass).await.unwrap();
        assert!(vc.flow_path_open().await);
        vc.close(ValveId::BvBypass).await.unwrap();
        vc.open(ValveId::Sv1).await.unwrap();
        assert!(vc.flow_path_open().await);
    }
}
