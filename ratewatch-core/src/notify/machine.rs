//! The per-subscriber notification state machine.
//!
//! One call to [`NotificationStateMachine::advance`] per subscriber per run.
//! Rules, in evaluation order:
//!
//! 1. Data unavailable: at most once per unbroken failure streak per tenor
//! 2. Band transition: on entry into an alert-worthy band; `last_band` is
//!    updated on every observation whether or not anything fired
//! 3. Momentum advisory: MID band only, premium subscribers only, once per
//!    local day per tenor
//! 4. Exceptional opportunity: one-shot per subscriber until reset
//! 5. Daily digest: once per local day, at the configured hour
//! 6. Payday reminder / payday: once per payday date each
//!
//! Every rule is idempotent on persisted markers, so re-running after an
//! interrupted run never double-notifies for the same condition.

use chrono::{DateTime, FixedOffset, Timelike};

use super::calendar::schedules_around;
use super::notification::{Notification, NotificationKind};
use super::rules::AlertRules;
use super::state::{SubscriberBook, SubscriberState};
use crate::domain::{Band, Rate, Tenor};

/// What this run knows about one tenor.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// A fresh value, banded against this subscriber's rules.
    Present {
        value: Rate,
        band: Band,
        /// Previous local days' closing values, oldest first.
        recent_closes: Vec<Rate>,
    },
    /// The value is known but could not be banded (history failure). Shown
    /// in digests, but the tenor's state is left untouched.
    Unbanded { value: Rate },
    /// The source returned nothing for this tenor.
    Absent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TenorObservation {
    pub tenor: Tenor,
    pub observation: Observation,
}

impl TenorObservation {
    pub fn present(tenor: Tenor, value: Rate, band: Band, recent_closes: Vec<Rate>) -> Self {
        Self {
            tenor,
            observation: Observation::Present {
                value,
                band,
                recent_closes,
            },
        }
    }

    pub fn absent(tenor: Tenor) -> Self {
        Self {
            tenor,
            observation: Observation::Absent,
        }
    }

    fn value(&self) -> Option<Rate> {
        match self.observation {
            Observation::Present { value, .. } | Observation::Unbanded { value } => Some(value),
            Observation::Absent => None,
        }
    }

    fn band(&self) -> Option<Band> {
        match self.observation {
            Observation::Present { band, .. } => Some(band),
            _ => None,
        }
    }
}

pub struct NotificationStateMachine<'a> {
    subscriber_id: &'a str,
    rules: &'a AlertRules,
    premium: bool,
}

impl<'a> NotificationStateMachine<'a> {
    pub fn new(subscriber_id: &'a str, rules: &'a AlertRules, premium: bool) -> Self {
        Self {
            subscriber_id,
            rules,
            premium,
        }
    }

    /// Apply one run's observations to `book` and return what to notify.
    ///
    /// `now` must already be in the subscriber's local offset: digest hour,
    /// intraday open and payday dates are all local-calendar rules.
    pub fn advance(
        &self,
        book: &mut SubscriberBook,
        observations: &[TenorObservation],
        now: DateTime<FixedOffset>,
    ) -> Vec<Notification> {
        let mut out = Vec::new();
        let mut super_candidate: Option<(Tenor, Rate)> = None;

        for obs in observations {
            match &obs.observation {
                Observation::Absent => {
                    let state = book.tenor_mut(obs.tenor);
                    state.premium_flag = self.premium;
                    if !state.last_error_flag {
                        state.last_error_flag = true;
                        out.push(self.notification(
                            Some(obs.tenor),
                            NotificationKind::DataUnavailable,
                            None,
                            format!(
                                "{}: no quote available from the source. \
                                 You will not be notified again until it recovers.",
                                obs.tenor
                            ),
                        ));
                    }
                }
                Observation::Unbanded { .. } => {}
                Observation::Present {
                    value,
                    band,
                    recent_closes,
                } => {
                    let state = book.tenor_mut(obs.tenor);
                    state.premium_flag = self.premium;
                    state.last_error_flag = false;
                    self.observe(state, obs.tenor, *value, *band, recent_closes, now, &mut out);

                    if let Some(threshold) = self.rules.super_threshold {
                        let beats_current = super_candidate.map_or(true, |(_, v)| *value > v);
                        if *value >= threshold && beats_current {
                            super_candidate = Some((obs.tenor, *value));
                        }
                    }
                }
            }
        }

        if let (Some((tenor, value)), Some(threshold)) = (super_candidate, self.rules.super_threshold)
        {
            if !book.super_alert_sent() {
                book.stamp_super_alert();
                out.push(self.notification(
                    Some(tenor),
                    NotificationKind::ExceptionalOpportunity,
                    Some(value),
                    format!(
                        "{tenor} at {value:.2}% crossed the exceptional level of {threshold:.2}%. \
                         This alert is sent only once."
                    ),
                ));
            }
        }

        self.digest(book, observations, now, &mut out);
        self.payday(book, observations, now, &mut out);
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn observe(
        &self,
        state: &mut SubscriberState,
        tenor: Tenor,
        value: Rate,
        band: Band,
        recent_closes: &[Rate],
        now: DateTime<FixedOffset>,
        out: &mut Vec<Notification>,
    ) {
        let today = now.date_naive();
        if state.intraday_open_date != Some(today) || state.intraday_open_value.is_none() {
            state.intraday_open_date = Some(today);
            state.intraday_open_value = Some(value);
        }

        // An unset band counts as LOW: a first-ever HIGH fires, a first LOW does not.
        let previous = state.last_band.unwrap_or(Band::Low);
        if self.rules.is_alert_worthy(band, previous) {
            out.push(self.notification(
                Some(tenor),
                NotificationKind::BandTransition {
                    from: state.last_band,
                    to: band,
                },
                Some(value),
                format!("{tenor}: {value:.2}% moved from {previous} to {band}."),
            ));
        }
        if state.last_band != Some(band) {
            state.band_entered_at = Some(now);
        }
        state.last_band = Some(band);

        if self.premium && band == Band::Mid && state.last_advisory_date != Some(today) {
            let open = state.intraday_open_value.unwrap_or(value);
            if let Some(reason) = self.momentum_reason(value, open, recent_closes) {
                state.last_advisory_date = Some(today);
                out.push(self.notification(
                    Some(tenor),
                    NotificationKind::MomentumAdvisory,
                    Some(value),
                    format!("{tenor}: {value:.2}% is still MID but {reason}."),
                ));
            }
        }
    }

    fn momentum_reason(&self, value: Rate, open: Rate, recent_closes: &[Rate]) -> Option<String> {
        let m = &self.rules.momentum;
        let closes: Vec<Rate> = recent_closes
            .iter()
            .rev()
            .take(m.lookback_days)
            .copied()
            .collect();
        if !closes.is_empty() {
            let avg = closes.iter().sum::<f64>() / closes.len() as f64;
            if value >= avg + m.avg_margin {
                return Some(format!(
                    "{:.2} above its {}-day average of {avg:.2}%",
                    value - avg,
                    closes.len()
                ));
            }
        }
        if value - open >= m.intraday_margin {
            return Some(format!(
                "up {:.2} since today's open of {open:.2}%",
                value - open
            ));
        }
        None
    }

    fn digest(
        &self,
        book: &mut SubscriberBook,
        observations: &[TenorObservation],
        now: DateTime<FixedOffset>,
        out: &mut Vec<Notification>,
    ) {
        let today = now.date_naive();
        if now.hour() != self.rules.digest_hour || book.digest_sent_on(today) {
            return;
        }
        for obs in observations {
            book.tenor_mut(obs.tenor);
        }
        book.stamp_digest(today);
        out.push(self.notification(
            None,
            NotificationKind::DailyDigest,
            None,
            format!("Daily summary {today}: {}.", rate_summary(observations)),
        ));
    }

    fn payday(
        &self,
        book: &mut SubscriberBook,
        observations: &[TenorObservation],
        now: DateTime<FixedOffset>,
        out: &mut Vec<Notification>,
    ) {
        let today = now.date_naive();
        let nth = self.rules.payday_business_day;
        let lead = self.rules.payday_reminder_lead;

        for schedule in schedules_around(today, nth, lead) {
            if lead > 0
                && today == schedule.reminder
                && book.payday.reminder_sent_for != Some(schedule.target)
            {
                book.payday.reminder_sent_for = Some(schedule.target);
                out.push(self.notification(
                    None,
                    NotificationKind::PaydayReminder,
                    None,
                    format!(
                        "Payday is {} (business day #{nth} of the month), \
                         {lead} business days from now. Current rates: {}.",
                        schedule.target,
                        rate_summary(observations)
                    ),
                ));
            }
            if today == schedule.target && book.payday.payday_sent_for != Some(schedule.target) {
                book.payday.payday_sent_for = Some(schedule.target);
                out.push(self.notification(
                    None,
                    NotificationKind::Payday,
                    None,
                    format!(
                        "Payday today ({today}). Current rates: {}.",
                        rate_summary(observations)
                    ),
                ));
            }
        }
    }

    fn notification(
        &self,
        tenor: Option<Tenor>,
        kind: NotificationKind,
        value: Option<Rate>,
        text: String,
    ) -> Notification {
        Notification {
            subscriber_id: self.subscriber_id.to_string(),
            tenor,
            kind,
            value,
            text,
        }
    }
}

/// `"1D 39.00% (HIGH), 7D n/a"`
fn rate_summary(observations: &[TenorObservation]) -> String {
    if observations.is_empty() {
        return "no tenors monitored".to_string();
    }
    observations
        .iter()
        .map(|obs| match (obs.value(), obs.band()) {
            (Some(v), Some(b)) => format!("{} {v:.2}% ({b})", obs.tenor),
            (Some(v), None) => format!("{} {v:.2}%", obs.tenor),
            (None, _) => format!("{} n/a", obs.tenor),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_day() -> Tenor {
        Tenor::from_days(1).unwrap()
    }

    fn at(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    fn kinds(ns: &[Notification]) -> Vec<&NotificationKind> {
        ns.iter().map(|n| &n.kind).collect()
    }

    #[test]
    fn digest_without_observations_is_sent_once() {
        let rules = AlertRules::default();
        let m = NotificationStateMachine::new("ana", &rules, false);
        let mut book = SubscriberBook::default();

        let sent: usize = ["18:05", "18:35", "18:50"]
            .iter()
            .map(|hm| {
                let out = m.advance(&mut book, &[], at(&format!("2026-01-21T{hm}:00-03:00")));
                out.iter()
                    .filter(|n| n.kind == NotificationKind::DailyDigest)
                    .count()
            })
            .sum();
        assert_eq!(sent, 1);
    }

    #[test]
    fn intraday_open_resets_each_day() {
        let rules = AlertRules::default();
        let m = NotificationStateMachine::new("ana", &rules, false);
        let mut book = SubscriberBook::default();

        m.advance(
            &mut book,
            &[TenorObservation::present(one_day(), 36.0, Band::Mid, vec![])],
            at("2026-01-21T10:00:00-03:00"),
        );
        m.advance(
            &mut book,
            &[TenorObservation::present(one_day(), 36.4, Band::Mid, vec![])],
            at("2026-01-21T11:00:00-03:00"),
        );
        assert_eq!(book.tenors[&one_day()].intraday_open_value, Some(36.0));

        m.advance(
            &mut book,
            &[TenorObservation::present(one_day(), 37.0, Band::Mid, vec![])],
            at("2026-01-22T10:00:00-03:00"),
        );
        let s = &book.tenors[&one_day()];
        assert_eq!(s.intraday_open_value, Some(37.0));
        assert_eq!(
            s.intraday_open_date,
            Some(chrono::NaiveDate::from_ymd_opt(2026, 1, 22).unwrap())
        );
    }

    #[test]
    fn band_entered_at_tracks_changes_only() {
        let rules = AlertRules::default();
        let m = NotificationStateMachine::new("ana", &rules, false);
        let mut book = SubscriberBook::default();
        let t0 = at("2026-01-21T10:00:00-03:00");
        let t1 = at("2026-01-21T11:00:00-03:00");

        m.advance(&mut book, &[TenorObservation::present(one_day(), 39.0, Band::High, vec![])], t0);
        m.advance(&mut book, &[TenorObservation::present(one_day(), 39.1, Band::High, vec![])], t1);
        assert_eq!(book.tenors[&one_day()].band_entered_at, Some(t0));
    }

    #[test]
    fn unbanded_leaves_state_untouched() {
        let rules = AlertRules::default();
        let m = NotificationStateMachine::new("ana", &rules, false);
        let mut book = SubscriberBook::default();
        let obs = TenorObservation {
            tenor: one_day(),
            observation: Observation::Unbanded { value: 50.0 },
        };
        let out = m.advance(&mut book, &[obs], at("2026-01-21T10:00:00-03:00"));
        assert!(out.is_empty());
        assert!(book.tenors.is_empty());
    }

    #[test]
    fn momentum_uses_rolling_average() {
        let rules = AlertRules::default(); // avg margin 0.8
        let m = NotificationStateMachine::new("ana", &rules, true);
        let mut book = SubscriberBook::default();
        let out = m.advance(
            &mut book,
            &[TenorObservation::present(
                one_day(),
                37.0,
                Band::Mid,
                vec![36.0, 36.0, 36.2],
            )],
            at("2026-01-21T10:00:00-03:00"),
        );
        assert_eq!(kinds(&out), vec![&NotificationKind::MomentumAdvisory]);
        assert!(out[0].text.contains("3-day average"));
    }

    #[test]
    fn rate_summary_formats_every_case() {
        let seven = Tenor::from_days(7).unwrap();
        let obs = vec![
            TenorObservation::present(one_day(), 39.0, Band::High, vec![]),
            TenorObservation {
                tenor: Tenor::from_days(14).unwrap(),
                observation: Observation::Unbanded { value: 40.0 },
            },
            TenorObservation::absent(seven),
        ];
        assert_eq!(rate_summary(&obs), "1D 39.00% (HIGH), 14D 40.00%, 7D n/a");
    }
}
