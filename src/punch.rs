//! Punch decisions: anti-bounce and IN/OUT auto-toggle.
//!
//! The employee's last direction and punch time live in the employees table
//! and are read and written inside the same IMMEDIATE transaction that
//! inserts the punch, so two identifications racing for one employee cannot
//! both pass the anti-bounce check.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Local, Utc};

use crate::matching::Candidate;
use crate::store::Store;
use crate::{new_punch_uid, Punch, PunchDirection, PunchType, SyncStatus};

#[derive(Clone, Debug)]
pub enum PunchDecision {
    Accepted(Punch),
    /// Within the anti-bounce window of the previous punch. Not an error.
    Suppressed {
        employee_code: String,
        elapsed: ChronoDuration,
    },
}

/// Outcome of the pure state-machine step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Punch(PunchType),
    Suppressed(ChronoDuration),
}

pub struct PunchDecider {
    antibounce: ChronoDuration,
    device_id: String,
    local_offset: Option<FixedOffset>,
}

impl PunchDecider {
    pub fn new(antibounce: std::time::Duration, device_id: &str) -> Result<Self> {
        let antibounce = ChronoDuration::from_std(antibounce)
            .map_err(|_| anyhow!("antibounce window out of range"))?;
        Ok(Self {
            antibounce,
            device_id: device_id.to_string(),
            local_offset: None,
        })
    }

    /// Record local timestamps in a fixed offset instead of the host time zone.
    pub fn with_local_offset(mut self, offset: FixedOffset) -> Self {
        self.local_offset = Some(offset);
        self
    }

    /// A clock that went backwards (negative elapsed) is treated as inside the window.
    pub fn decide(
        &self,
        direction: PunchDirection,
        last_punch_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Verdict {
        if let Some(last) = last_punch_time {
            let elapsed = now - last;
            if elapsed < self.antibounce {
                return Verdict::Suppressed(elapsed);
            }
        }
        Verdict::Punch(direction.next_punch())
    }

    pub fn on_identified(
        &self,
        store: &mut Store,
        candidate: &Candidate,
        now: DateTime<Utc>,
    ) -> Result<PunchDecision> {
        let tx = store.begin_punch()?;
        let employee = tx
            .employee(candidate.employee_id)?
            .ok_or_else(|| anyhow!("employee {} not found", candidate.employee_code))?;
        if !employee.active {
            return Err(anyhow!("employee {} is inactive", employee.employee_code));
        }

        let punch_type = match self.decide(
            employee.last_punch_direction,
            employee.last_punch_time,
            now,
        ) {
            Verdict::Suppressed(elapsed) => {
                log::info!(
                    "anti-bounce: {} punched {}s ago, ignoring",
                    employee.employee_code,
                    elapsed.num_seconds()
                );
                return Ok(PunchDecision::Suppressed {
                    employee_code: employee.employee_code,
                    elapsed,
                });
            }
            Verdict::Punch(punch_type) => punch_type,
        };

        let mut punch = Punch {
            id: 0,
            punch_uid: new_punch_uid(),
            employee_id: employee.id,
            employee_code: employee.employee_code,
            device_id: self.device_id.clone(),
            timestamp_utc: now,
            timestamp_local: self.local_time(now),
            punch_type,
            match_score: candidate.score,
            sync_status: SyncStatus::Pending,
            sync_attempts: 0,
            last_sync_attempt_time: None,
            last_sync_error: None,
            needs_attention: false,
        };
        punch.id = tx.record(&punch)?;
        log::info!(
            "punch recorded: {} {} (score={})",
            punch.employee_code,
            punch.punch_type.as_str(),
            punch.match_score
        );
        Ok(PunchDecision::Accepted(punch))
    }

    fn local_time(&self, now: DateTime<Utc>) -> DateTime<FixedOffset> {
        match self.local_offset {
            Some(offset) => now.with_timezone(&offset),
            None => now.with_timezone(&Local).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_memory_uri;
    use chrono::TimeZone;
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap()
    }

    fn decider() -> PunchDecider {
        PunchDecider::new(Duration::from_secs(10), "CHECADOR-TEST").unwrap()
    }

    #[test]
    fn first_punch_is_in() {
        assert_eq!(
            decider().decide(PunchDirection::None, None, t0()),
            Verdict::Punch(PunchType::In)
        );
    }

    #[test]
    fn window_boundary_allows_punch() {
        let d = decider();
        let last = Some(t0());
        assert_eq!(
            d.decide(PunchDirection::In, last, t0() + ChronoDuration::seconds(10)),
            Verdict::Punch(PunchType::Out)
        );
        assert!(matches!(
            d.decide(PunchDirection::In, last, t0() + ChronoDuration::milliseconds(9_999)),
            Verdict::Suppressed(_)
        ));
    }

    #[test]
    fn clock_going_backwards_is_suppressed() {
        assert!(matches!(
            decider().decide(PunchDirection::Out, Some(t0()), t0() - ChronoDuration::seconds(30)),
            Verdict::Suppressed(_)
        ));
    }

    #[test]
    fn strict_alternation_across_punches() -> Result<()> {
        let mut store = Store::open(&shared_memory_uri())?;
        let employee = store.create_employee("EMP001", "Ana", t0())?;
        let candidate = Candidate {
            employee_id: employee.id,
            employee_code: employee.employee_code.clone(),
            name: employee.name.clone(),
            score: 50,
        };
        let d = decider().with_local_offset(FixedOffset::west_opt(6 * 3600).unwrap());
        let mut types = Vec::new();
        for i in 0..4 {
            let now = t0() + ChronoDuration::minutes(i * 5);
            match d.on_identified(&mut store, &candidate, now)? {
                PunchDecision::Accepted(punch) => {
                    assert_eq!(punch.timestamp_local.offset().local_minus_utc(), -6 * 3600);
                    types.push(punch.punch_type);
                }
                other => panic!("unexpected decision {:?}", other),
            }
        }
        assert_eq!(
            types,
            vec![PunchType::In, PunchType::Out, PunchType::In, PunchType::Out]
        );
        Ok(())
    }

    #[test]
    fn suppressed_punch_leaves_no_trace() -> Result<()> {
        let mut store = Store::open(&shared_memory_uri())?;
        let employee = store.create_employee("EMP001", "Ana", t0())?;
        let candidate = Candidate {
            employee_id: employee.id,
            employee_code: employee.employee_code.clone(),
            name: employee.name.clone(),
            score: 50,
        };
        let d = decider();
        assert!(matches!(
            d.on_identified(&mut store, &candidate, t0())?,
            PunchDecision::Accepted(_)
        ));
        assert!(matches!(
            d.on_identified(&mut store, &candidate, t0() + ChronoDuration::seconds(3))?,
            PunchDecision::Suppressed { .. }
        ));
        assert_eq!(store.recent_punches(None, 10)?.len(), 1);
        let state = store.employee(employee.id)?.ok_or_else(|| anyhow!("missing"))?;
        assert_eq!(state.last_punch_direction, PunchDirection::In);
        assert_eq!(state.last_punch_time, Some(t0()));
        Ok(())
    }

    #[test]
    fn inactive_employee_cannot_punch() -> Result<()> {
        let mut store = Store::open(&shared_memory_uri())?;
        let employee = store.create_employee("EMP009", "Gone", t0())?;
        store.deactivate_employee("EMP009")?;
        let candidate = Candidate {
            employee_id: employee.id,
            employee_code: employee.employee_code,
            name: employee.name,
            score: 60,
        };
        assert!(decider().on_identified(&mut store, &candidate, t0()).is_err());
        Ok(())
    }
}
