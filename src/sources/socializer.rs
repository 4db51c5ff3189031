//! The socializer: a source that causes us to socialize.
//!
//! Coffee bot pairs people up for coffees on a schedule. The matching step
//! is a pure, deterministic function of an ordered roster and the pairing
//! history; any randomization happens strictly before it, by shuffling the
//! roster. History is symmetric (count(a, b) == count(b, a)) and
//! insertion-ordered per person, with re-pairings moved to the end so the
//! most recent partner is always the last entry.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc, Weekday};
use indexmap::IndexMap;
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::config::Category;
use crate::error::{Result, TellusError};
use crate::sources::{Source, SourceInfo};
use crate::tell::Tell;
use crate::teller::Teller;
use crate::users::UserManager;

pub const SOURCE_ID: &str = "socializer";

/// Users carrying this tag participate in coffee bot.
pub const TAG_COFFEE_BOT: &str = "coffee-bot";

/// The internal tell that backs the coffee schedule.
pub const COFFEE_BOT_ALIAS: &str = "tellus-coffee-bot";

/// Sentinel partner for the odd person out.
pub const BYE_WEEK: &str = "BYEWEEK";

const TAG_FORCE_COFFEE: &str = "force-coffee";
const TAG_PAUSE_COFFEE: &str = "pause-coffee";

const DATUM_CURRENT_SCHEDULE: &str = "coffee schedule";
const DATUM_SCHEDULED_USERS: &str = "users in schedule";
const DATUM_SCHEDULE_CREATED: &str = "coffee schedule created on";
const DATUM_CURRENT_PAIR: &str = "coffee-pair";
const DATUM_HISTORY: &str = "coffee-history";
const DATUM_LAST_RUN: &str = "last coffee bot run";

const MIN_DAYS_BETWEEN_RUNS: i64 = 5;

/// Pairing counts per person, insertion-ordered by recency per partner.
pub type PairHistory = BTreeMap<String, IndexMap<String, u64>>;

// ---------------------------------------------------------------------------
// The matching algorithm
// ---------------------------------------------------------------------------

/// Shuffle the roster, then hand off to the deterministic matching step.
pub fn make_schedule(people: &[String], history: &PairHistory) -> Vec<(String, String)> {
    let mut shuffled = people.to_vec();
    shuffled.shuffle(&mut rand::thread_rng());
    schedule_pairs(&shuffled, history)
}

/// Produce a perfect matching over the roster (an odd roster gets one bye).
/// Pure function of the roster order and the history: people with the most
/// recorded coffees are placed first, and each is paired with the remaining
/// candidate they have had the fewest coffees with.
pub fn schedule_pairs(roster: &[String], history: &PairHistory) -> Vec<(String, String)> {
    let mut remaining = roster.to_vec();
    if remaining.len() % 2 == 1 {
        remaining.push(BYE_WEEK.to_string());
    }

    let mut pairings = Vec::new();
    for person in sorted_by_history_volume(&remaining, history) {
        if remaining.len() > 1 {
            if let Some(position) = remaining.iter().position(|p| *p == person) {
                remaining.remove(position);
                let person_history = history.get(&person);
                if let Some(partner) = find_best_pair(person_history, &remaining) {
                    if let Some(position) = remaining.iter().position(|p| *p == partner) {
                        remaining.remove(position);
                    }
                    pairings.push((person, partner));
                }
            }
        }
    }

    if remaining.len() > 1 {
        log::error!("Had more than one unpaired person - that really shouldn't be possible: {remaining:?}");
    }
    for bye in remaining {
        pairings.push((bye, BYE_WEEK.to_string()));
    }

    pairings
}

/// Order people for matching: highest total historical pairing volume first.
/// The sort is stable, so ties keep the incoming roster order.
pub fn sorted_by_history_volume(roster: &[String], history: &PairHistory) -> Vec<String> {
    let mut ordered = roster.to_vec();
    ordered.sort_by_key(|person| {
        let total: u64 = history
            .get(person)
            .map(|counts| counts.values().sum())
            .unwrap_or(0);
        std::cmp::Reverse(total)
    });
    ordered
}

/// The candidate with the lowest recorded count against this person. A
/// candidate with no history at all wins immediately; ties keep the earliest
/// candidate.
fn find_best_pair(
    person_history: Option<&IndexMap<String, u64>>,
    candidates: &[String],
) -> Option<String> {
    let mut best: Option<(&String, u64)> = None;
    for candidate in candidates {
        match person_history.and_then(|counts| counts.get(candidate)) {
            None => return Some(candidate.clone()),
            Some(&count) => match best {
                Some((_, best_count)) if count >= best_count => {}
                _ => best = Some((candidate, count)),
            },
        }
    }
    best.map(|(candidate, _)| candidate.clone())
}

/// Bump the count for one direction of a pairing, re-inserting the partner
/// key at the end of the person's history so recency is derivable from
/// position. Callers record both directions to keep history symmetric.
pub fn record_pairing(history: &mut PairHistory, person: &str, partner: &str) {
    let counts = history.entry(person.to_string()).or_default();
    let count = counts.get(partner).copied().unwrap_or(0);
    if count > 0 {
        counts.shift_remove(partner);
    }
    counts.insert(partner.to_string(), count + 1);
}

/// The partner the given person has in a schedule, if any.
pub fn pair_from_schedule(username: &str, schedule: &[(String, String)]) -> Option<String> {
    schedule.iter().find_map(|(a, b)| {
        if a == username {
            Some(b.clone())
        } else if b == username {
            Some(a.clone())
        } else {
            None
        }
    })
}

// ---------------------------------------------------------------------------
// CoffeeBot
// ---------------------------------------------------------------------------

/// A wrapper around the coffee schedule tell, to make it a cleaner
/// abstraction. Construction is validated: the tell must be internal.
pub struct CoffeeBot<'a> {
    tell: &'a mut Tell,
}

impl<'a> CoffeeBot<'a> {
    pub fn new(tell: &'a mut Tell) -> Result<CoffeeBot<'a>> {
        if !tell.in_category(Category::Internal) {
            return Err(TellusError::InvalidUpdate(format!(
                "Coffee bot can only wrap an internal tell, not '{}'.",
                tell.alias()
            )));
        }
        let mut bot = CoffeeBot { tell };
        if bot.tell.get_data(SOURCE_ID).is_none() {
            bot.set_history(&PairHistory::new());
        }
        Ok(bot)
    }

    fn datum(&self, key: &str) -> Option<&Value> {
        self.tell.get_datum(SOURCE_ID, key)
    }

    fn update_datum(&mut self, key: &str, value: Value) {
        self.tell
            .update_datum_from_source(SOURCE_ID, key, value, None);
    }

    pub fn current_schedule(&self) -> Option<Vec<(String, String)>> {
        self.datum(DATUM_CURRENT_SCHEDULE)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn scheduled_users(&self) -> Vec<String> {
        self.datum(DATUM_SCHEDULED_USERS)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }

    pub fn coffee_with(&self, username: &str) -> Option<String> {
        self.current_schedule()
            .and_then(|schedule| pair_from_schedule(username, &schedule))
    }

    pub fn force_run(&mut self) {
        self.tell.add_tag(TAG_FORCE_COFFEE);
    }

    pub fn pause(&mut self, pause: bool) {
        if pause {
            self.tell.add_tag(TAG_PAUSE_COFFEE);
        } else {
            self.tell.remove_tag(TAG_PAUSE_COFFEE);
        }
    }

    pub fn paused(&self) -> bool {
        self.tell.has_tag(TAG_PAUSE_COFFEE)
    }

    pub fn finished_run(&mut self) {
        if self.tell.remove_tag(TAG_FORCE_COFFEE).is_some() {
            log::info!("Coffee was forced, removed {TAG_FORCE_COFFEE} tag.");
        }
        self.update_datum(DATUM_LAST_RUN, json!(Utc::now().to_rfc3339()));
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        self.datum(DATUM_LAST_RUN)
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc))
    }

    pub fn history(&self) -> PairHistory {
        self.datum(DATUM_HISTORY)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }

    pub fn set_history(&mut self, history: &PairHistory) {
        self.update_datum(DATUM_HISTORY, json!(history));
    }

    pub fn history_for(&self, person: &str) -> IndexMap<String, u64> {
        self.history().remove(person).unwrap_or_default()
    }

    /// Generate a new schedule from the roster, replacing the current one.
    pub fn update_schedule(&mut self, people: &[String]) {
        let history = self.history();
        let schedule = make_schedule(people, &history);
        self.update_datum(DATUM_CURRENT_SCHEDULE, json!(schedule));
        self.update_datum(DATUM_SCHEDULE_CREATED, json!(Utc::now().to_rfc3339()));
        let mut scheduled = people.to_vec();
        scheduled.sort();
        self.update_datum(DATUM_SCHEDULED_USERS, json!(scheduled));
    }

    /// Should we generate new coffees? `as_of` overrides the clock, for
    /// testing.
    pub fn should_generate(&self, as_of: Option<DateTime<Utc>>) -> bool {
        !self.paused()
            && (self.tell.has_tag(TAG_FORCE_COFFEE)
                || self.check_calendar(as_of)
                || self.current_schedule().is_none())
    }

    /// Coffee bot generally just runs on Sundays, unless it ran too
    /// recently. A bot that has never run requires manual intervention.
    fn check_calendar(&self, as_of: Option<DateTime<Utc>>) -> bool {
        let Some(last_run) = self.last_run() else {
            log::warn!(
                "Coffee bot does not think it has been run before, so will not run \
                 automatically. You will need to force a run."
            );
            return false;
        };

        let as_of = as_of.unwrap_or_else(Utc::now);
        if as_of.weekday() == Weekday::Sun {
            if as_of - chrono::Duration::days(MIN_DAYS_BETWEEN_RUNS) > last_run {
                return true;
            }
            log::warn!(
                "Coffee bot was last run on {last_run}, less than {MIN_DAYS_BETWEEN_RUNS} days \
                 ago, so will not run. It will run automatically again next week."
            );
        }

        log::debug!("Coffee bot currently only runs on Sundays, so is still taking a nap!");
        false
    }
}

// ---------------------------------------------------------------------------
// The source
// ---------------------------------------------------------------------------

/// The source wrapper that drives coffee bot from the orchestrator.
pub struct Socializer {
    info: SourceInfo,
    teller: Arc<RwLock<Teller>>,
    users: Arc<RwLock<UserManager>>,
}

impl Socializer {
    pub fn new(
        teller: Arc<RwLock<Teller>>,
        users: Arc<RwLock<UserManager>>,
    ) -> Result<Socializer> {
        let info = SourceInfo::new(SOURCE_ID, "Manages setting up coffees, lunches, etc.")?;
        Ok(Socializer {
            info,
            teller,
            users,
        })
    }

    /// Make sure the coffee bot tell exists; on first creation, schedule an
    /// immediate run.
    fn ensure_coffee_tell(teller: &mut Teller) -> Result<()> {
        if teller.has_tell(COFFEE_BOT_ALIAS) {
            return Ok(());
        }
        log::info!("No coffee bot tell yet, creating it and scheduling a run.");
        let tell = teller.create_tell_with(
            COFFEE_BOT_ALIAS,
            Category::Internal,
            SOURCE_ID,
            None,
            Some("Shh...I am a secret tell for coffee bot."),
        )?;
        // Editable for now, so the schedule can be adjusted by hand.
        tell.make_user_modified();
        let mut bot = CoffeeBot::new(tell)?;
        bot.force_run();
        Ok(())
    }

    /// Everyone active who has opted into coffee bot.
    fn coffee_roster(users: &UserManager, teller: &Teller) -> Vec<String> {
        users
            .active_users(teller)
            .into_iter()
            .filter(|user| user.tell().has_tag(TAG_COFFEE_BOT))
            .map(|user| user.username().to_string())
            .collect()
    }

    /// Lock in the current pairings: once this runs, history is written and
    /// coffee bot considers them to have happened for future scheduling.
    fn lock_in_schedule(
        teller: &mut Teller,
        users: &UserManager,
    ) -> Result<BTreeMap<String, String>> {
        let (schedule, scheduled_users, mut history) = {
            let bot = CoffeeBot::new(teller.get_mut(COFFEE_BOT_ALIAS)?)?;
            (
                bot.current_schedule().unwrap_or_default(),
                bot.scheduled_users(),
                bot.history(),
            )
        };

        let mut pairings = BTreeMap::new();
        for username in users.active_usernames(teller) {
            let tell = teller.get_mut(&username)?;
            tell.clear_data(SOURCE_ID);
            if !scheduled_users.contains(&username) {
                continue;
            }
            let Some(partner) = pair_from_schedule(&username, &schedule) else {
                continue;
            };
            record_pairing(&mut history, &username, &partner);
            tell.update_datum_from_source(
                SOURCE_ID,
                DATUM_CURRENT_PAIR,
                json!(partner),
                None,
            );
            let own_history = history.get(&username).cloned().unwrap_or_default();
            tell.update_datum_from_source(SOURCE_ID, DATUM_HISTORY, json!(own_history), None);
            pairings.insert(username, partner);
        }

        let mut bot = CoffeeBot::new(teller.get_mut(COFFEE_BOT_ALIAS)?)?;
        bot.set_history(&history);
        bot.finished_run();
        Ok(pairings)
    }
}

#[async_trait]
impl Source for Socializer {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut SourceInfo {
        &mut self.info
    }

    async fn load(&mut self) -> anyhow::Result<String> {
        let teller_ref = Arc::clone(&self.teller);
        let users_ref = Arc::clone(&self.users);
        let mut teller = teller_ref.write().await;
        let users = users_ref.read().await;

        Socializer::ensure_coffee_tell(&mut teller)?;
        let should_generate =
            CoffeeBot::new(teller.get_mut(COFFEE_BOT_ALIAS)?)?.should_generate(None);

        let message = if should_generate {
            log::info!("Makin' coffee!");
            let roster = Socializer::coffee_roster(&users, &teller);
            CoffeeBot::new(teller.get_mut(COFFEE_BOT_ALIAS)?)?.update_schedule(&roster);
            let pairings = Socializer::lock_in_schedule(&mut teller, &users)?;
            teller.persist()?;
            format!("Coffee bot ran successfully. Pairings: {pairings:?}")
        } else if CoffeeBot::new(teller.get_mut(COFFEE_BOT_ALIAS)?)?.paused() {
            "Coffee bot is presently paused, and will not generate new coffee schedules."
                .to_string()
        } else {
            "Coffee bot already ran - it will not run again until the weekend, unless forced."
                .to_string()
        };

        log::debug!("{message}");
        Ok(message)
    }
}
