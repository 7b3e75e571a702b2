use crate::errors::PipelineError;
use std::time::{Duration, Instant};

/// Which section budget applies to an MTA event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutClass {
    Connect,
    Command,
    Content,
    AddHeader,
}

impl TimeoutClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutClass::Connect => "connect",
            TimeoutClass::Command => "command",
            TimeoutClass::Content => "content",
            TimeoutClass::AddHeader => "addheader",
        }
    }
}

/// Nested cooperative deadlines: one budget for the whole session, one for
/// the current callback section, and an optional handler-local one for a
/// single lookup.
///
/// The effective deadline at any moment is the minimum of the three.
/// A budget of zero seconds in configuration means "disarmed" and is
/// represented here by the absence of a deadline.
#[derive(Debug, Default)]
pub struct DeadlineStack {
    overall: Option<Instant>,
    section: Option<Instant>,
    handler: Option<Instant>,
}

impl DeadlineStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_overall(&mut self, budget: Duration) {
        self.overall = Some(Instant::now() + budget);
    }

    pub fn clear_overall(&mut self) {
        self.overall = None;
    }

    /// Arm the per-section deadline. `None` disarms the section budget.
    pub fn arm_section(&mut self, budget: Option<Duration>) {
        self.section = budget.map(|b| Instant::now() + b);
        self.handler = None;
    }

    pub fn disarm_section(&mut self) {
        self.section = None;
        self.handler = None;
    }

    /// Arm a handler-local deadline for a single blocking scope. The armed
    /// value never exceeds what remains of the outer budgets.
    pub fn arm_handler(&mut self, budget: Duration) {
        let capped = match self.outer_remaining() {
            Some(outer) => budget.min(outer),
            None => budget,
        };
        self.handler = Some(Instant::now() + capped);
    }

    /// Drop the handler-local deadline and fall back to the outer budget.
    /// Raises a timeout when the outer budget is already exhausted.
    pub fn reset_to_outer(&mut self, site: &str) -> Result<(), PipelineError> {
        self.handler = None;
        match self.outer_remaining() {
            Some(rem) if rem.is_zero() => Err(PipelineError::timeout(site)),
            _ => Ok(()),
        }
    }

    fn outer_remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        [self.overall, self.section]
            .iter()
            .flatten()
            .map(|d| d.saturating_duration_since(now))
            .min()
    }

    /// Time left until the innermost armed deadline. `None` when nothing is
    /// armed; `Some(ZERO)` when a deadline has already passed.
    pub fn time_remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        [self.overall, self.section, self.handler]
            .iter()
            .flatten()
            .map(|d| d.saturating_duration_since(now))
            .min()
    }

    /// Raise a timeout when the innermost armed deadline has passed.
    pub fn check_now(&self, site: &str) -> Result<(), PipelineError> {
        match self.time_remaining() {
            Some(rem) if rem.is_zero() => Err(PipelineError::timeout(site)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unarmed_never_expires() {
        let timer = DeadlineStack::new();
        assert_eq!(timer.time_remaining(), None);
        assert!(timer.check_now("idle").is_ok());
    }

    #[test]
    fn expired_section_raises() {
        let mut timer = DeadlineStack::new();
        timer.arm_section(Some(Duration::ZERO));
        let err = timer.check_now("connect").unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn handler_deadline_is_capped_by_section() {
        let mut timer = DeadlineStack::new();
        timer.arm_section(Some(Duration::from_millis(10)));
        timer.arm_handler(Duration::from_secs(3600));
        let rem = timer.time_remaining().unwrap();
        assert!(rem <= Duration::from_millis(10));
    }

    #[test]
    fn reset_to_outer_restores_section_budget() {
        let mut timer = DeadlineStack::new();
        timer.arm_section(Some(Duration::from_secs(60)));
        timer.arm_handler(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(2));
        // Handler scope expired, the section did not.
        assert!(timer.check_now("dns").is_err());
        assert!(timer.reset_to_outer("dns").is_ok());
        assert!(timer.check_now("dns").is_ok());
    }

    #[test]
    fn reset_to_outer_raises_when_outer_gone() {
        let mut timer = DeadlineStack::new();
        timer.arm_section(Some(Duration::ZERO));
        timer.arm_handler(Duration::from_secs(5));
        assert!(timer.reset_to_outer("dns").unwrap_err().is_timeout());
    }

    #[test]
    fn innermost_deadline_wins() {
        let mut timer = DeadlineStack::new();
        timer.set_overall(Duration::from_secs(300));
        timer.arm_section(Some(Duration::from_secs(30)));
        let rem = timer.time_remaining().unwrap();
        assert!(rem <= Duration::from_secs(30));
        timer.disarm_section();
        let rem = timer.time_remaining().unwrap();
        assert!(rem > Duration::from_secs(30));
    }
}
