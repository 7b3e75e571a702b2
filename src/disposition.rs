use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref REJECT_REASON: Regex = Regex::new(r"^5\d\d 5\.\d\.\d .*").unwrap();
    static ref DEFER_REASON: Regex = Regex::new(r"^4\d\d 4\.\d\.\d .*").unwrap();
}

const DEFAULT_REJECT: &str = "550 5.0.0 Message rejected";
const DEFAULT_DEFER: &str = "450 4.0.0 Message deferred";

/// Final answer for one MTA event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventResponse {
    Continue,
    Accept,
    Reject(String),
    Tempfail(String),
    Discard,
}

/// Collects the reject/defer/quarantine requests handlers make for a
/// message and arbitrates the single code returned to the MTA.
///
/// Precedence: reject > defer > quarantine > handler-set code > continue.
/// Quarantine itself answers `continue`; its observable effect is the
/// X-Disposition-Quarantine header the accumulator emits.
#[derive(Debug, Default)]
pub struct DispositionRegister {
    reject_reason: Option<String>,
    defer_reason: Option<String>,
    quarantine_reason: Option<String>,
    return_code: Option<EventResponse>,
}

impl DispositionRegister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_mail(&mut self, reason: &str) {
        let reason = if REJECT_REASON.is_match(reason) {
            reason.to_string()
        } else {
            log::info!("invalid reject reason {reason:?}, using {DEFAULT_REJECT:?}");
            DEFAULT_REJECT.to_string()
        };
        self.reject_reason = Some(reason);
    }

    pub fn defer_mail(&mut self, reason: &str) {
        let reason = if DEFER_REASON.is_match(reason) {
            reason.to_string()
        } else {
            log::info!("invalid defer reason {reason:?}, using {DEFAULT_DEFER:?}");
            DEFAULT_DEFER.to_string()
        };
        self.defer_reason = Some(reason);
    }

    pub fn quarantine_mail(&mut self, reason: &str) {
        self.quarantine_reason = Some(reason.to_string());
    }

    /// Handler-set return code; weakest of the disposition sources.
    pub fn set_return(&mut self, code: EventResponse) {
        self.return_code = Some(code);
    }

    pub fn quarantine_reason(&self) -> Option<&str> {
        self.quarantine_reason.as_deref()
    }

    pub fn get_reject_mail(&self) -> Option<&str> {
        self.reject_reason.as_deref()
    }

    pub fn get_defer_mail(&self) -> Option<&str> {
        self.defer_reason.as_deref()
    }

    pub fn get_return(&self) -> EventResponse {
        if let Some(reason) = &self.reject_reason {
            EventResponse::Reject(reason.clone())
        } else if let Some(reason) = &self.defer_reason {
            EventResponse::Tempfail(reason.clone())
        } else if self.quarantine_reason.is_some() {
            EventResponse::Continue
        } else {
            self.return_code.clone().unwrap_or(EventResponse::Continue)
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_continue() {
        assert_eq!(DispositionRegister::new().get_return(), EventResponse::Continue);
    }

    #[test]
    fn invalid_reject_reason_is_rewritten() {
        let mut disp = DispositionRegister::new();
        disp.reject_mail("nope");
        assert_eq!(
            disp.get_return(),
            EventResponse::Reject("550 5.0.0 Message rejected".to_string())
        );
    }

    #[test]
    fn mismatched_status_classes_are_rewritten() {
        let mut disp = DispositionRegister::new();
        disp.reject_mail("999 9.9.9 nope");
        assert_eq!(disp.get_reject_mail(), Some("550 5.0.0 Message rejected"));

        let mut disp = DispositionRegister::new();
        // 5xx status with a 4.x.x extended status does not agree.
        disp.reject_mail("550 4.0.0 wrong class");
        assert_eq!(disp.get_reject_mail(), Some("550 5.0.0 Message rejected"));
    }

    #[test]
    fn valid_reasons_pass_through() {
        let mut disp = DispositionRegister::new();
        disp.reject_mail("550 5.7.1 SPF hardfail");
        assert_eq!(
            disp.get_return(),
            EventResponse::Reject("550 5.7.1 SPF hardfail".to_string())
        );

        let mut disp = DispositionRegister::new();
        disp.defer_mail("451 4.7.1 Greylisted");
        assert_eq!(
            disp.get_return(),
            EventResponse::Tempfail("451 4.7.1 Greylisted".to_string())
        );
    }

    #[test]
    fn precedence_reject_defer_quarantine_handler() {
        let mut disp = DispositionRegister::new();
        disp.set_return(EventResponse::Accept);
        assert_eq!(disp.get_return(), EventResponse::Accept);

        disp.quarantine_mail("looks odd");
        assert_eq!(disp.get_return(), EventResponse::Continue);

        disp.defer_mail("450 4.2.0 Try later");
        assert_eq!(
            disp.get_return(),
            EventResponse::Tempfail("450 4.2.0 Try later".to_string())
        );

        disp.reject_mail("554 5.7.1 Denied");
        assert_eq!(
            disp.get_return(),
            EventResponse::Reject("554 5.7.1 Denied".to_string())
        );
    }

    #[test]
    fn quarantine_alone_is_continue_with_reason_recorded() {
        let mut disp = DispositionRegister::new();
        disp.quarantine_mail("policy");
        assert_eq!(disp.get_return(), EventResponse::Continue);
        assert_eq!(disp.quarantine_reason(), Some("policy"));
    }
}
