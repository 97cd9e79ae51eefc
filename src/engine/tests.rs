use super::*;
use crate::calendar::{OccurrenceFilter, RecurrenceRule};
use crate::clock::ManualClock;
use crate::limits::*;
use chrono::{NaiveDate, NaiveTime, Weekday};
use tokio_test::{assert_err, assert_ok};

const M: Ms = 60_000; // 1 minute in ms
const H: Ms = 60 * M;

fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("barre_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

/// Monday 2026-03-02, noon at the studio.
fn noon_monday() -> Ms {
    StudioTime::utc().combine(d(2), t(12, 0))
}

struct Studio {
    engine: Arc<Engine>,
    clock: Arc<ManualClock>,
    path: PathBuf,
    admin: Ulid,
    trainer_user: Ulid,
    trainer: Ulid,
    style: Ulid,
}

impl Studio {
    async fn open(name: &str) -> Self {
        Self::open_with_grace(name, 0).await
    }

    async fn open_with_grace(name: &str, grace: Ms) -> Self {
        let path = test_wal_path(name);
        let clock = Arc::new(ManualClock::new(noon_monday()));
        let engine = Arc::new(
            Engine::new(path.clone(), clock.clone(), StudioTime::utc())
                .unwrap()
                .with_missed_grace(grace),
        );

        let admin = Ulid::new();
        engine.ensure_admin(admin, "Owner").await.unwrap();

        let style = Ulid::new();
        engine
            .create_style(
                admin,
                DanceStyle {
                    id: style,
                    name: "Salsa".into(),
                    description: "Cuban style".into(),
                    image: None,
                },
            )
            .await
            .unwrap();

        let (trainer_user, trainer) = add_trainer(&engine, admin, vec![style]).await;

        Self {
            engine,
            clock,
            path,
            admin,
            trainer_user,
            trainer,
            style,
        }
    }

    async fn client(&self) -> Ulid {
        let id = Ulid::new();
        self.engine
            .create_account(
                self.admin,
                Account {
                    id,
                    role: Role::Client,
                    name: format!("client {id}"),
                    is_staff: false,
                },
            )
            .await
            .unwrap();
        id
    }

    fn entry(&self, date: NaiveDate, start: NaiveTime, end: NaiveTime, max: u32) -> ScheduleEntry {
        ScheduleEntry {
            id: Ulid::new(),
            class_date: date,
            start_time: start,
            end_time: end,
            dance_style: self.style,
            trainer: self.trainer,
            max_participants: max,
            is_active: true,
        }
    }

    /// 90 minute class taught by the fixture trainer.
    async fn class(&self, date: NaiveDate, start: NaiveTime, max: u32) -> ScheduleEntry {
        let end = start + chrono::Duration::minutes(90);
        let entry = self.entry(date, start, end, max);
        self.engine.create_schedule(self.admin, entry.clone()).await.unwrap();
        entry
    }
}

async fn add_trainer(engine: &Engine, admin: Ulid, styles: Vec<Ulid>) -> (Ulid, Ulid) {
    let user = Ulid::new();
    engine
        .create_account(
            admin,
            Account {
                id: user,
                role: Role::Trainer,
                name: "Trainer".into(),
                is_staff: false,
            },
        )
        .await
        .unwrap();
    let trainer = Ulid::new();
    engine
        .create_trainer(
            admin,
            Trainer {
                id: trainer,
                user_id: user,
                bio: "Ten years on stage".into(),
                photo: None,
                styles,
            },
        )
        .await
        .unwrap();
    (user, trainer)
}

// ── Booking ──────────────────────────────────────────────

#[tokio::test]
async fn book_creates_booked_record() {
    let s = Studio::open("book_creates.wal").await;
    let class = s.class(d(3), t(18, 0), 10).await;
    let client = s.client().await;

    let b = s.engine.book(client, Ulid::new(), class.id).await.unwrap();
    assert_eq!(b.status, BookingStatus::Booked);
    assert_eq!(b.class_date, class.class_date);
    assert_eq!(b.booking_date, noon_monday());
    assert_eq!(s.engine.available_slots(class.id).await.unwrap(), 9);
}

#[tokio::test]
async fn book_checks_role_first() {
    let s = Studio::open("book_role_first.wal").await;
    // even a missing schedule reports the role problem first
    let missing = Ulid::new();
    assert!(matches!(
        s.engine.book(s.trainer_user, Ulid::new(), missing).await,
        Err(EngineError::NotClient)
    ));
    assert!(matches!(
        s.engine.book(s.admin, Ulid::new(), missing).await,
        Err(EngineError::NotClient)
    ));
    assert!(matches!(
        s.engine.book(Ulid::new(), Ulid::new(), missing).await,
        Err(EngineError::NotClient)
    ));

    let client = s.client().await;
    assert!(matches!(
        s.engine.book(client, Ulid::new(), missing).await,
        Err(EngineError::ScheduleNotFound(id)) if id == missing
    ));
}

#[tokio::test]
async fn book_rejects_inactive_class() {
    let s = Studio::open("book_inactive.wal").await;
    let class = s.class(d(3), t(18, 0), 10).await;
    s.engine
        .update_schedule(
            s.admin,
            class.id,
            SchedulePatch {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let client = s.client().await;
    assert!(matches!(
        s.engine.book(client, Ulid::new(), class.id).await,
        Err(EngineError::ScheduleInactive(_))
    ));
}

#[tokio::test]
async fn book_rejects_class_already_started() {
    let s = Studio::open("book_started.wal").await;
    // started five minutes ago
    let class = s.class(d(2), t(11, 55), 10).await;
    let client = s.client().await;
    assert!(matches!(
        s.engine.book(client, Ulid::new(), class.id).await,
        Err(EngineError::ClassAlreadyStarted(_))
    ));

    // exactly at start is also too late
    let later = s.class(d(2), t(13, 30), 10).await;
    s.clock.set(StudioTime::utc().combine(d(2), t(13, 30)));
    assert!(matches!(
        s.engine.book(client, Ulid::new(), later.id).await,
        Err(EngineError::ClassAlreadyStarted(_))
    ));
}

#[tokio::test]
async fn second_booking_for_same_class_rejected() {
    let s = Studio::open("book_twice.wal").await;
    let class = s.class(d(3), t(18, 0), 10).await;
    let client = s.client().await;
    s.engine.book(client, Ulid::new(), class.id).await.unwrap();
    assert!(matches!(
        s.engine.book(client, Ulid::new(), class.id).await,
        Err(EngineError::AlreadyBooked(_))
    ));
    assert_eq!(s.engine.available_slots(class.id).await.unwrap(), 9);
}

#[tokio::test]
async fn full_class_rejects_booking() {
    let s = Studio::open("book_full.wal").await;
    let class = s.class(d(3), t(18, 0), 2).await;
    for _ in 0..2 {
        let c = s.client().await;
        s.engine.book(c, Ulid::new(), class.id).await.unwrap();
    }
    let late = s.client().await;
    assert!(matches!(
        s.engine.book(late, Ulid::new(), class.id).await,
        Err(EngineError::ClassFull(2))
    ));
}

#[tokio::test]
async fn duplicate_booking_id_rejected() {
    let s = Studio::open("book_dup_id.wal").await;
    let class = s.class(d(3), t(18, 0), 10).await;
    let (a, b) = (s.client().await, s.client().await);
    let id = Ulid::new();
    s.engine.book(a, id, class.id).await.unwrap();
    assert!(matches!(
        s.engine.book(b, id, class.id).await,
        Err(EngineError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn same_booking_id_lands_once_on_a_busy_class() {
    let s = Studio::open("book_dup_id_race.wal").await;
    let class = s.class(d(3), t(18, 0), 10).await;
    let (a, b) = (s.client().await, s.client().await);
    let id = Ulid::new();

    // both requests queue behind a writer before either checks the id
    let cell = s.engine.store().get_schedule(&class.id).unwrap();
    let busy = cell.write().await;
    let (e1, e2) = (s.engine.clone(), s.engine.clone());
    let schedule_id = class.id;
    let h1 = tokio::spawn(async move { e1.book(a, id, schedule_id).await });
    let h2 = tokio::spawn(async move { e2.book(b, id, schedule_id).await });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    drop(busy);
    let results = [h1.await.unwrap(), h2.await.unwrap()];

    let winner = results.iter().find_map(|r| r.as_ref().ok()).unwrap().client_id;
    let loser = results.iter().find(|r| r.is_err()).unwrap();
    assert!(matches!(loser, Err(EngineError::AlreadyExists(x)) if *x == id));

    let roster = s.engine.schedule_roster(s.admin, class.id).await.unwrap();
    assert_eq!(roster.iter().filter(|r| r.id == id).count(), 1);
    assert_ok!(s.engine.cancel(winner, id).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_booking_id_lands_once_across_classes() {
    let s = Studio::open("book_dup_id_two_classes.wal").await;
    let first = s.class(d(3), t(18, 0), 10).await;
    let second = s.class(d(4), t(18, 0), 10).await;
    let (a, b) = (s.client().await, s.client().await);
    let id = Ulid::new();

    let (e1, e2) = (s.engine.clone(), s.engine.clone());
    let (c1, c2) = (first.id, second.id);
    let h1 = tokio::spawn(async move { e1.book(a, id, c1).await });
    let h2 = tokio::spawn(async move { e2.book(b, id, c2).await });
    let results = [h1.await.unwrap(), h2.await.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let won = results.iter().find_map(|r| r.as_ref().ok()).unwrap().clone();
    assert_eq!(s.engine.store().schedule_for_booking(&id), Some(won.schedule_id));
    assert_ok!(s.engine.cancel(won.client_id, id).await);
}

#[tokio::test]
async fn refused_booking_frees_its_id() {
    let s = Studio::open("book_id_released.wal").await;
    let full = s.class(d(3), t(18, 0), 1).await;
    let open = s.class(d(4), t(18, 0), 1).await;
    let (a, b) = (s.client().await, s.client().await);
    s.engine.book(a, Ulid::new(), full.id).await.unwrap();

    let id = Ulid::new();
    assert!(matches!(
        s.engine.book(b, id, full.id).await,
        Err(EngineError::ClassFull(1))
    ));
    assert_eq!(s.engine.store().schedule_for_booking(&id), None);
    let booking = s.engine.book(b, id, open.id).await.unwrap();
    assert_eq!(booking.schedule_id, open.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_seat_goes_to_exactly_one_client() {
    let s = Studio::open("book_last_seat.wal").await;
    let class = s.class(d(3), t(18, 0), 1).await;
    let (a, b) = (s.client().await, s.client().await);

    let schedule_id = class.id;
    let e1 = s.engine.clone();
    let e2 = s.engine.clone();
    let h1 = tokio::spawn(async move { e1.book(a, Ulid::new(), schedule_id).await });
    let h2 = tokio::spawn(async move { e2.book(b, Ulid::new(), schedule_id).await });
    let results = [h1.await.unwrap(), h2.await.unwrap()];

    let ok = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok, 1);
    let loser = results.iter().find(|r| r.is_err()).unwrap();
    assert!(matches!(
        loser,
        Err(EngineError::ClassFull(1)) | Err(EngineError::ConcurrencyConflict(_))
    ));
    assert_eq!(s.engine.available_slots(class.id).await.unwrap(), 0);
    let late = s.client().await;
    assert_err!(s.engine.book(late, Ulid::new(), schedule_id).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_rush_never_overbooks() {
    let s = Studio::open("book_rush.wal").await;
    let class = s.class(d(3), t(18, 0), 5).await;
    let mut clients = Vec::new();
    for _ in 0..25 {
        clients.push(s.client().await);
    }

    let schedule_id = class.id;
    let mut handles = Vec::new();
    for c in clients {
        let engine = s.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.book(c, Ulid::new(), schedule_id).await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::ClassFull(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 5);
    let roster = s.engine.schedule_roster(s.admin, class.id).await.unwrap();
    let booked = roster.iter().filter(|b| b.status == BookingStatus::Booked).count();
    assert_eq!(booked, 5);
}

// ── Cancellation ─────────────────────────────────────────

#[tokio::test]
async fn cancel_keeps_record_and_blocks_rebooking() {
    let s = Studio::open("cancel_retained.wal").await;
    let class = s.class(d(3), t(18, 0), 1).await;
    let client = s.client().await;
    let b = s.engine.book(client, Ulid::new(), class.id).await.unwrap();

    let cancelled = s.engine.cancel(client, b.id).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(cancelled.booking_date, b.booking_date);

    // seat is free again
    assert_eq!(s.engine.available_slots(class.id).await.unwrap(), 1);
    let other = s.client().await;
    assert_ok!(s.engine.book(other, Ulid::new(), class.id).await);

    // the cancelled row still counts for uniqueness
    assert!(matches!(
        s.engine.book(client, Ulid::new(), class.id).await,
        Err(EngineError::AlreadyBooked(_))
    ));
}

#[tokio::test]
async fn cancel_twice_is_invalid_transition() {
    let s = Studio::open("cancel_twice.wal").await;
    let class = s.class(d(3), t(18, 0), 10).await;
    let client = s.client().await;
    let b = s.engine.book(client, Ulid::new(), class.id).await.unwrap();
    assert_ok!(s.engine.cancel(client, b.id).await);
    assert!(matches!(
        s.engine.cancel(client, b.id).await,
        Err(EngineError::InvalidTransition {
            from: BookingStatus::Cancelled,
            to: BookingStatus::Cancelled
        })
    ));
}

#[tokio::test]
async fn cannot_cancel_someone_elses_booking() {
    let s = Studio::open("cancel_foreign.wal").await;
    let class = s.class(d(3), t(18, 0), 10).await;
    let (owner, intruder) = (s.client().await, s.client().await);
    let b = s.engine.book(owner, Ulid::new(), class.id).await.unwrap();

    assert!(matches!(
        s.engine.cancel(intruder, b.id).await,
        Err(EngineError::BookingNotFound(_))
    ));
    assert!(matches!(
        s.engine.cancel(s.trainer_user, b.id).await,
        Err(EngineError::NotClient)
    ));
    assert!(matches!(
        s.engine.cancel(owner, Ulid::new()).await,
        Err(EngineError::BookingNotFound(_))
    ));
}

// ── Trainer marks ────────────────────────────────────────

#[tokio::test]
async fn mark_attended_moves_only_booked() {
    let s = Studio::open("mark_attended.wal").await;
    let class = s.class(d(3), t(18, 0), 10).await;
    let mut booked = Vec::new();
    for _ in 0..3 {
        let c = s.client().await;
        booked.push(s.engine.book(c, Ulid::new(), class.id).await.unwrap().id);
    }
    let quitter = s.client().await;
    let gone = s.engine.book(quitter, Ulid::new(), class.id).await.unwrap();
    s.engine.cancel(quitter, gone.id).await.unwrap();

    s.clock.set(StudioTime::utc().combine(d(3), t(19, 0)));
    assert_eq!(s.engine.mark_attended(s.trainer_user, class.id).await.unwrap(), 3);

    let roster = s.engine.schedule_roster(s.trainer_user, class.id).await.unwrap();
    for b in &roster {
        if booked.contains(&b.id) {
            assert_eq!(b.status, BookingStatus::Attended);
        } else {
            assert_eq!(b.status, BookingStatus::Cancelled);
        }
    }

    // nothing left to move
    assert_eq!(s.engine.mark_cancelled(s.trainer_user, class.id).await.unwrap(), 0);
}

#[tokio::test]
async fn mark_cancelled_by_trainer() {
    let s = Studio::open("mark_cancelled.wal").await;
    let class = s.class(d(3), t(18, 0), 10).await;
    let c = s.client().await;
    let b = s.engine.book(c, Ulid::new(), class.id).await.unwrap();
    s.clock.set(StudioTime::utc().combine(d(3), t(18, 0)));
    assert_eq!(s.engine.mark_cancelled(s.trainer_user, class.id).await.unwrap(), 1);
    let roster = s.engine.schedule_roster(s.trainer_user, class.id).await.unwrap();
    assert_eq!(roster[0].id, b.id);
    assert_eq!(roster[0].status, BookingStatus::Cancelled);
}

#[tokio::test]
async fn marks_require_the_classes_own_trainer() {
    let s = Studio::open("mark_auth.wal").await;
    let class = s.class(d(3), t(18, 0), 10).await;
    let (other_user, _) = add_trainer(&s.engine, s.admin, vec![s.style]).await;
    let client = s.client().await;
    s.clock.set(StudioTime::utc().combine(d(3), t(19, 0)));

    assert!(matches!(
        s.engine.mark_attended(other_user, class.id).await,
        Err(EngineError::NotTrainer)
    ));
    assert!(matches!(
        s.engine.mark_attended(client, class.id).await,
        Err(EngineError::NotTrainer)
    ));
    assert!(matches!(
        s.engine.mark_attended(s.admin, class.id).await,
        Err(EngineError::NotTrainer)
    ));
    assert!(matches!(
        s.engine.schedule_roster(other_user, class.id).await,
        Err(EngineError::NotTrainer)
    ));
}

#[tokio::test]
async fn marks_wait_for_class_start() {
    let s = Studio::open("mark_early.wal").await;
    let class = s.class(d(3), t(18, 0), 10).await;
    assert!(matches!(
        s.engine.mark_attended(s.trainer_user, class.id).await,
        Err(EngineError::ClassNotStarted(_))
    ));
}

// ── Reconciliation ───────────────────────────────────────

#[tokio::test]
async fn reconcile_marks_yesterdays_bookings_missed() {
    let s = Studio::open("reconcile_yesterday.wal").await;
    s.clock.set(StudioTime::utc().combine(d(1), t(9, 0)));
    let class = s.class(d(1), t(18, 0), 10).await;
    let client = s.client().await;
    let b = s.engine.book(client, Ulid::new(), class.id).await.unwrap();

    s.clock.set(noon_monday());
    assert_eq!(s.engine.reconcile(noon_monday()).await, 1);
    let roster = s.engine.schedule_roster(s.admin, class.id).await.unwrap();
    assert_eq!(roster[0].id, b.id);
    assert_eq!(roster[0].status, BookingStatus::Missed);

    // second pass finds nothing
    assert_eq!(s.engine.reconcile(noon_monday()).await, 0);
}

#[tokio::test]
async fn reconcile_waits_for_a_busy_class() {
    let s = Studio::open("reconcile_busy.wal").await;
    s.clock.set(StudioTime::utc().combine(d(1), t(9, 0)));
    let class = s.class(d(1), t(18, 0), 10).await;
    let client = s.client().await;
    s.engine.book(client, Ulid::new(), class.id).await.unwrap();
    s.clock.set(noon_monday());

    let cell = s.engine.store().get_schedule(&class.id).unwrap();
    let busy = cell.write().await;
    let engine = s.engine.clone();
    let sweep = tokio::spawn(async move { engine.reconcile(noon_monday()).await });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    drop(busy);

    assert_eq!(sweep.await.unwrap(), 1);
    assert_eq!(s.engine.reconcile(noon_monday()).await, 0);
}

#[tokio::test]
async fn reconcile_leaves_future_and_terminal_alone() {
    let s = Studio::open("reconcile_scope.wal").await;
    s.clock.set(StudioTime::utc().combine(d(1), t(9, 0)));
    let past = s.class(d(1), t(18, 0), 10).await;
    let future = s.class(d(3), t(18, 0), 10).await;
    let (a, b) = (s.client().await, s.client().await);
    let cancelled = s.engine.book(a, Ulid::new(), past.id).await.unwrap();
    s.engine.cancel(a, cancelled.id).await.unwrap();
    s.engine.book(b, Ulid::new(), past.id).await.unwrap();
    s.engine.book(a, Ulid::new(), future.id).await.unwrap();

    s.clock.set(noon_monday());
    assert_eq!(s.engine.reconcile(noon_monday()).await, 1);

    let past_roster = s.engine.schedule_roster(s.admin, past.id).await.unwrap();
    let statuses: Vec<BookingStatus> = past_roster.iter().map(|b| b.status).collect();
    assert_eq!(statuses, vec![BookingStatus::Cancelled, BookingStatus::Missed]);
    let future_roster = s.engine.schedule_roster(s.admin, future.id).await.unwrap();
    assert_eq!(future_roster[0].status, BookingStatus::Booked);
}

#[tokio::test]
async fn grace_gives_trainers_time_to_mark() {
    let path = test_wal_path("reconcile_grace.wal");
    let clock = Arc::new(ManualClock::new(noon_monday()));
    let engine = Engine::new(path, clock.clone(), StudioTime::utc())
        .unwrap()
        .with_missed_grace(30 * M);
    let admin = Ulid::new();
    engine.ensure_admin(admin, "Owner").await.unwrap();
    let style = Ulid::new();
    engine
        .create_style(
            admin,
            DanceStyle {
                id: style,
                name: "Tango".into(),
                description: String::new(),
                image: None,
            },
        )
        .await
        .unwrap();
    let (trainer_user, trainer) = add_trainer(&engine, admin, vec![style]).await;
    let class = ScheduleEntry {
        id: Ulid::new(),
        class_date: d(2),
        start_time: t(14, 0),
        end_time: t(15, 0),
        dance_style: style,
        trainer,
        max_participants: 4,
        is_active: true,
    };
    engine.create_schedule(admin, class.clone()).await.unwrap();
    let client = Ulid::new();
    engine
        .create_account(
            admin,
            Account {
                id: client,
                role: Role::Client,
                name: "Dana".into(),
                is_staff: false,
            },
        )
        .await
        .unwrap();
    engine.book(client, Ulid::new(), class.id).await.unwrap();

    let start = StudioTime::utc().combine(d(2), t(14, 0));
    assert_eq!(engine.reconcile(start + 10 * M).await, 0);
    clock.set(start + 20 * M);
    assert_eq!(engine.mark_attended(trainer_user, class.id).await.unwrap(), 1);
    assert_eq!(engine.reconcile(start + H).await, 0);
}

#[tokio::test]
async fn admin_sweep_runs_at_engine_time() {
    let s = Studio::open("sweep_admin.wal").await;
    s.clock.set(StudioTime::utc().combine(d(1), t(9, 0)));
    let class = s.class(d(1), t(18, 0), 10).await;
    let client = s.client().await;
    s.engine.book(client, Ulid::new(), class.id).await.unwrap();
    s.clock.set(noon_monday());

    assert!(matches!(
        s.engine.sweep_missed(client).await,
        Err(EngineError::NotAdmin)
    ));
    assert_eq!(s.engine.sweep_missed(s.admin).await.unwrap(), 1);
}

// ── Client profile ───────────────────────────────────────

#[tokio::test]
async fn client_bookings_split_and_stats() {
    let s = Studio::open("client_profile.wal").await;
    s.clock.set(StudioTime::utc().combine(d(1), t(9, 0)));
    let sunday = s.class(d(1), t(18, 0), 10).await;
    s.clock.set(noon_monday());
    let tuesday = s.class(d(3), t(18, 0), 10).await;
    let wednesday = s.class(d(4), t(10, 0), 10).await;
    let thursday = s.class(d(5), t(10, 0), 10).await;
    let client = s.client().await;

    s.clock.set(StudioTime::utc().combine(d(1), t(9, 0)));
    let stale = s.engine.book(client, Ulid::new(), sunday.id).await.unwrap();
    s.clock.set(noon_monday());
    let later = s.engine.book(client, Ulid::new(), wednesday.id).await.unwrap();
    s.clock.advance(M);
    let sooner = s.engine.book(client, Ulid::new(), tuesday.id).await.unwrap();
    s.clock.advance(M);
    let dropped = s.engine.book(client, Ulid::new(), thursday.id).await.unwrap();
    s.engine.cancel(client, dropped.id).await.unwrap();

    let profile = s.engine.client_bookings(client).await.unwrap();
    let active: Vec<Ulid> = profile.active.iter().map(|v| v.booking.id).collect();
    assert_eq!(active, vec![sooner.id, later.id]);

    // newest booking first
    let history: Vec<Ulid> = profile.history.iter().map(|v| v.booking.id).collect();
    assert_eq!(history, vec![dropped.id, stale.id]);

    // the stale record is reported missed but not rewritten
    assert_eq!(profile.history[1].effective_status, BookingStatus::Missed);
    assert_eq!(profile.history[1].booking.status, BookingStatus::Booked);
    let roster = s.engine.schedule_roster(s.admin, sunday.id).await.unwrap();
    assert_eq!(roster[0].status, BookingStatus::Booked);

    assert_eq!(
        profile.stats,
        BookingStats {
            booked: 2,
            attended: 0,
            missed: 1,
            cancelled: 1,
            total_history: 2,
            attendance_rate: 0.0,
        }
    );
}

#[tokio::test]
async fn started_class_stays_active_during_grace() {
    let s = Studio::open_with_grace("client_grace.wal", 30 * M).await;
    let class = s.class(d(2), t(14, 0), 10).await;
    let client = s.client().await;
    let booking = s.engine.book(client, Ulid::new(), class.id).await.unwrap();
    let start = StudioTime::utc().combine(d(2), t(14, 0));

    s.clock.set(start + 10 * M);
    let profile = s.engine.client_bookings(client).await.unwrap();
    assert_eq!(profile.active.len(), 1);
    assert_eq!(profile.active[0].booking.id, booking.id);
    assert!(profile.history.is_empty());
    assert_eq!(profile.stats.booked, 1);
    assert_eq!(profile.stats.total_history, 0);

    s.clock.set(start + 31 * M);
    let profile = s.engine.client_bookings(client).await.unwrap();
    assert!(profile.active.is_empty());
    assert_eq!(profile.history[0].effective_status, BookingStatus::Missed);
    assert_eq!(profile.stats.missed, 1);
    assert_eq!(profile.stats.booked, 0);
}

#[tokio::test]
async fn attendance_rate_counts_terminal_history() {
    let s = Studio::open("client_rate.wal").await;
    let client = s.client().await;
    let mut classes = Vec::new();
    for (i, day) in [3u32, 4, 5, 6].into_iter().enumerate() {
        let c = s.class(d(day), t(10 + i as u32, 0), 10).await;
        s.engine.book(client, Ulid::new(), c.id).await.unwrap();
        classes.push(c);
    }
    s.clock.set(StudioTime::utc().combine(d(7), t(9, 0)));
    for c in &classes[..3] {
        s.engine.mark_attended(s.trainer_user, c.id).await.unwrap();
    }
    s.engine.reconcile(s.engine.now_ms()).await;

    let stats = s.engine.client_bookings(client).await.unwrap().stats;
    assert_eq!(stats.attended, 3);
    assert_eq!(stats.missed, 1);
    assert_eq!(stats.total_history, 4);
    assert!((stats.attendance_rate - 0.75).abs() < f64::EPSILON);
}

#[tokio::test]
async fn trainers_have_no_client_profile() {
    let s = Studio::open("client_profile_role.wal").await;
    assert!(matches!(
        s.engine.client_bookings(s.trainer_user).await,
        Err(EngineError::NotClient)
    ));
}

// ── Timetable ────────────────────────────────────────────

#[tokio::test]
async fn occurrences_flags_and_order() {
    let s = Studio::open("occ_flags.wal").await;
    let sunday = s.class(d(1), t(18, 0), 10).await;
    let this_morning = s.class(d(2), t(9, 0), 10).await;
    let tonight = s.class(d(2), t(18, 0), 1).await;
    let tuesday = s.class(d(3), t(18, 0), 10).await;
    let client = s.client().await;
    s.engine.book(client, Ulid::new(), tonight.id).await.unwrap();

    let occ = s
        .engine
        .occurrences_in_range(OccurrenceFilter::default(), d(1), d(7))
        .await
        .unwrap();
    let ids: Vec<Ulid> = occ.iter().map(|o| o.entry.id).collect();
    assert_eq!(ids, vec![sunday.id, this_morning.id, tonight.id, tuesday.id]);

    assert!(occ[0].is_past && !occ[0].booking_open);
    assert!(occ[1].is_today && !occ[1].booking_open); // already started
    assert!(occ[2].is_today && !occ[2].booking_open); // full
    assert_eq!((occ[2].taken, occ[2].available), (1, 0));
    assert!(occ[3].is_future && occ[3].booking_open);
    assert_eq!(occ[3].available, 10);
}

#[tokio::test]
async fn occurrences_filter_and_skip_inactive() {
    let s = Studio::open("occ_filter.wal").await;
    let other_style = Ulid::new();
    s.engine
        .create_style(
            s.admin,
            DanceStyle {
                id: other_style,
                name: "Hip-hop".into(),
                description: String::new(),
                image: None,
            },
        )
        .await
        .unwrap();
    let (_, other_trainer) = add_trainer(&s.engine, s.admin, vec![other_style]).await;

    let salsa = s.class(d(3), t(18, 0), 10).await;
    let hiphop = ScheduleEntry {
        dance_style: other_style,
        trainer: other_trainer,
        ..s.entry(d(3), t(18, 0), t(19, 0), 10)
    };
    s.engine.create_schedule(s.admin, hiphop.clone()).await.unwrap();
    let off = s.class(d(4), t(18, 0), 10).await;
    s.engine
        .update_schedule(
            s.admin,
            off.id,
            SchedulePatch {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let by_style = s
        .engine
        .occurrences_in_range(
            OccurrenceFilter {
                dance_style: Some(other_style),
                trainer: None,
            },
            d(1),
            d(7),
        )
        .await
        .unwrap();
    assert_eq!(by_style.len(), 1);
    assert_eq!(by_style[0].entry.id, hiphop.id);

    let by_trainer = s
        .engine
        .occurrences_in_range(
            OccurrenceFilter {
                dance_style: None,
                trainer: Some(s.trainer),
            },
            d(1),
            d(7),
        )
        .await
        .unwrap();
    let ids: Vec<Ulid> = by_trainer.iter().map(|o| o.entry.id).collect();
    assert_eq!(ids, vec![salsa.id]);

    // inactive entries still resolve directly
    assert!(!s.engine.get_schedule(off.id).await.unwrap().entry.is_active);
}

#[tokio::test]
async fn occurrences_window_is_bounded() {
    let s = Studio::open("occ_window.wal").await;
    let too_far = d(1) + chrono::Duration::days(MAX_QUERY_DAYS);
    assert!(matches!(
        s.engine
            .occurrences_in_range(OccurrenceFilter::default(), d(1), too_far)
            .await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        s.engine
            .occurrences_in_range(OccurrenceFilter::default(), d(5), d(1))
            .await,
        Err(EngineError::InvalidTimeRange)
    ));
}

// ── Catalog invariants ───────────────────────────────────

#[tokio::test]
async fn trainer_cannot_double_book_a_slot() {
    let s = Studio::open("catalog_overlap.wal").await;
    let first = s.class(d(3), t(18, 0), 10).await;
    let clash = s.entry(d(3), t(19, 0), t(20, 0), 10);
    assert!(matches!(
        s.engine.create_schedule(s.admin, clash).await,
        Err(EngineError::TrainerConflict(id)) if id == first.id
    ));

    // back-to-back is fine
    let next = s.entry(d(3), t(19, 30), t(20, 30), 10);
    s.engine.create_schedule(s.admin, next.clone()).await.unwrap();

    // moving it onto the first class is not
    assert!(matches!(
        s.engine
            .update_schedule(
                s.admin,
                next.id,
                SchedulePatch {
                    start_time: Some(t(19, 0)),
                    ..Default::default()
                },
            )
            .await,
        Err(EngineError::TrainerConflict(_))
    ));
}

#[tokio::test]
async fn inactive_slot_frees_the_trainer() {
    let s = Studio::open("catalog_inactive_overlap.wal").await;
    let first = s.class(d(3), t(18, 0), 10).await;
    s.engine
        .update_schedule(
            s.admin,
            first.id,
            SchedulePatch {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let replacement = s.entry(d(3), t(18, 0), t(19, 30), 10);
    s.engine.create_schedule(s.admin, replacement).await.unwrap();

    // reactivating the original would now overlap
    assert!(matches!(
        s.engine
            .update_schedule(
                s.admin,
                first.id,
                SchedulePatch {
                    is_active: Some(true),
                    ..Default::default()
                },
            )
            .await,
        Err(EngineError::TrainerConflict(_))
    ));
}

#[tokio::test]
async fn class_duration_is_bounded() {
    let s = Studio::open("catalog_duration.wal").await;
    let short = s.entry(d(3), t(9, 0), t(9, 45), 10);
    let long = s.entry(d(3), t(9, 0), t(14, 30), 10);
    let backwards = s.entry(d(3), t(10, 0), t(9, 0), 10);
    assert!(matches!(
        s.engine.create_schedule(s.admin, short).await,
        Err(EngineError::DurationOutOfRange(_))
    ));
    assert!(matches!(
        s.engine.create_schedule(s.admin, long).await,
        Err(EngineError::DurationOutOfRange(_))
    ));
    assert!(matches!(
        s.engine.create_schedule(s.admin, backwards).await,
        Err(EngineError::InvalidTimeRange)
    ));
}

#[tokio::test]
async fn capacity_cannot_drop_below_booked() {
    let s = Studio::open("catalog_capacity.wal").await;
    let class = s.class(d(3), t(18, 0), 5).await;
    for _ in 0..3 {
        let c = s.client().await;
        s.engine.book(c, Ulid::new(), class.id).await.unwrap();
    }
    let lower = |n| SchedulePatch {
        max_participants: Some(n),
        ..Default::default()
    };
    assert!(matches!(
        s.engine.update_schedule(s.admin, class.id, lower(2)).await,
        Err(EngineError::CapacityBelowBooked {
            requested: 2,
            booked: 3
        })
    ));
    let updated = s.engine.update_schedule(s.admin, class.id, lower(3)).await.unwrap();
    assert_eq!(updated.max_participants, 3);
    assert_eq!(s.engine.available_slots(class.id).await.unwrap(), 0);
}

#[tokio::test]
async fn moving_a_class_keeps_weekday_in_step() {
    let s = Studio::open("catalog_weekday.wal").await;
    let class = s.class(d(3), t(18, 0), 10).await;
    assert_eq!(class.day_of_week(), Weekday::Tue);
    let moved = s
        .engine
        .update_schedule(
            s.admin,
            class.id,
            SchedulePatch {
                class_date: Some(d(6)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(moved.day_of_week(), Weekday::Fri);
    let view = s.engine.get_schedule(class.id).await.unwrap();
    assert_eq!(view.entry.day_of_week(), Weekday::Fri);
    assert_eq!(view.date, d(6));
}

#[tokio::test]
async fn delete_schedule_cascades_bookings() {
    let s = Studio::open("catalog_delete.wal").await;
    let class = s.class(d(3), t(18, 0), 10).await;
    let client = s.client().await;
    let b = s.engine.book(client, Ulid::new(), class.id).await.unwrap();

    assert_eq!(s.engine.delete_schedule(s.admin, class.id).await.unwrap(), 1);
    assert!(matches!(
        s.engine.get_schedule(class.id).await,
        Err(EngineError::ScheduleNotFound(_))
    ));
    assert!(matches!(
        s.engine.cancel(client, b.id).await,
        Err(EngineError::BookingNotFound(_))
    ));
    let profile = s.engine.client_bookings(client).await.unwrap();
    assert!(profile.active.is_empty() && profile.history.is_empty());
    assert!(matches!(
        s.engine.delete_schedule(s.admin, class.id).await,
        Err(EngineError::ScheduleNotFound(_))
    ));
}

#[tokio::test]
async fn seats_on_a_deleted_class_are_not_found() {
    let s = Studio::open("slots_tombstone.wal").await;
    let class = s.class(d(3), t(18, 0), 10).await;

    // the read queues behind the delete and must see the tombstone
    let cell = s.engine.store().get_schedule(&class.id).unwrap();
    let mut deleting = cell.write().await;
    let engine = s.engine.clone();
    let schedule_id = class.id;
    let read = tokio::spawn(async move { engine.available_slots(schedule_id).await });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    s.engine.store().remove_schedule(&mut deleting);
    drop(deleting);

    assert!(matches!(
        read.await.unwrap(),
        Err(EngineError::ScheduleNotFound(id)) if id == class.id
    ));
}

#[tokio::test]
async fn style_in_use_cannot_be_deleted() {
    let s = Studio::open("catalog_style_in_use.wal").await;
    assert!(matches!(
        s.engine.delete_style(s.admin, s.style).await,
        Err(EngineError::StyleInUse(_))
    ));

    let spare = Ulid::new();
    s.engine
        .create_style(
            s.admin,
            DanceStyle {
                id: spare,
                name: "Waltz".into(),
                description: String::new(),
                image: None,
            },
        )
        .await
        .unwrap();
    let renamed = s
        .engine
        .update_style(
            s.admin,
            spare,
            StylePatch {
                name: Some("Viennese Waltz".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(renamed.name, "Viennese Waltz");
    s.engine.delete_style(s.admin, spare).await.unwrap();
    assert!(s.engine.list_styles().iter().all(|st| st.id != spare));
}

#[tokio::test]
async fn trainer_profile_needs_trainer_account() {
    let s = Studio::open("catalog_trainer_role.wal").await;
    let client = s.client().await;
    let attempt = Trainer {
        id: Ulid::new(),
        user_id: client,
        bio: String::new(),
        photo: None,
        styles: vec![],
    };
    assert!(matches!(
        s.engine.create_trainer(s.admin, attempt).await,
        Err(EngineError::InvalidRole(_))
    ));

    // one profile per account
    let dup = Trainer {
        id: Ulid::new(),
        user_id: s.trainer_user,
        bio: String::new(),
        photo: None,
        styles: vec![],
    };
    assert!(matches!(
        s.engine.create_trainer(s.admin, dup).await,
        Err(EngineError::AlreadyExists(_))
    ));

    assert!(matches!(
        s.engine
            .set_trainer_styles(s.admin, s.trainer, vec![Ulid::new()])
            .await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn catalog_writes_need_admin() {
    let s = Studio::open("catalog_admin_gate.wal").await;
    let client = s.client().await;
    let entry = s.entry(d(3), t(18, 0), t(19, 0), 10);
    assert!(matches!(
        s.engine.create_schedule(client, entry.clone()).await,
        Err(EngineError::NotAdmin)
    ));
    assert!(matches!(
        s.engine.create_schedule(s.trainer_user, entry).await,
        Err(EngineError::NotAdmin)
    ));
    assert!(matches!(
        s.engine.delete_style(Ulid::new(), s.style).await,
        Err(EngineError::NotAdmin)
    ));
}

#[tokio::test]
async fn ensure_admin_is_idempotent() {
    let s = Studio::open("catalog_ensure_admin.wal").await;
    assert!(!s.engine.ensure_admin(s.admin, "Owner").await.unwrap());
    let client = s.client().await;
    assert!(matches!(
        s.engine.ensure_admin(client, "Owner").await,
        Err(EngineError::InvalidRole(_))
    ));
}

// ── Recurrence ───────────────────────────────────────────

fn weekly(s: &Studio, day: Weekday, start: NaiveDate, end: Option<NaiveDate>) -> RecurrenceRule {
    RecurrenceRule {
        day_of_week: day,
        start_date: start,
        end_date: end,
        start_time: t(18, 0),
        end_time: t(19, 30),
        dance_style: s.style,
        trainer: s.trainer,
        max_participants: 12,
    }
}

#[tokio::test]
async fn recurrence_materializes_per_date_entries() {
    let s = Studio::open("recur_materialize.wal").await;
    let rule = weekly(&s, Weekday::Wed, d(1), Some(d(31)));
    let created = s
        .engine
        .create_recurring_schedules(s.admin, rule, None)
        .await
        .unwrap();
    let dates: Vec<NaiveDate> = created.iter().map(|e| e.class_date).collect();
    assert_eq!(dates, vec![d(4), d(11), d(18), d(25)]);

    let occ = s
        .engine
        .occurrences_in_range(OccurrenceFilter::default(), d(1), d(31))
        .await
        .unwrap();
    assert_eq!(occ.len(), 4);
    assert!(occ.iter().all(|o| o.entry.day_of_week() == Weekday::Wed));
}

#[tokio::test]
async fn recurrence_is_all_or_nothing() {
    let s = Studio::open("recur_atomic.wal").await;
    // blocks the third Wednesday
    s.class(d(18), t(19, 0), 10).await;
    let rule = weekly(&s, Weekday::Wed, d(1), Some(d(31)));
    assert!(matches!(
        s.engine.create_recurring_schedules(s.admin, rule, None).await,
        Err(EngineError::TrainerConflict(_))
    ));
    let occ = s
        .engine
        .occurrences_in_range(OccurrenceFilter::default(), d(1), d(31))
        .await
        .unwrap();
    assert_eq!(occ.len(), 1);
}

#[tokio::test]
async fn open_ended_recurrence_uses_until() {
    let s = Studio::open("recur_until.wal").await;
    let rule = weekly(&s, Weekday::Mon, d(2), None);
    let created = s
        .engine
        .create_recurring_schedules(s.admin, rule, Some(d(16)))
        .await
        .unwrap();
    assert_eq!(created.len(), 3);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let s = Studio::open("durable_restart.wal").await;
    let class = s.class(d(3), t(18, 0), 3).await;
    let client = s.client().await;
    let kept = s.engine.book(client, Ulid::new(), class.id).await.unwrap();
    let other = s.client().await;
    let gone = s.engine.book(other, Ulid::new(), class.id).await.unwrap();
    s.engine.cancel(other, gone.id).await.unwrap();
    let doomed = s.class(d(4), t(18, 0), 3).await;
    s.engine.delete_schedule(s.admin, doomed.id).await.unwrap();

    let reopened = Engine::new(s.path.clone(), s.clock.clone(), StudioTime::utc()).unwrap();
    let roster = reopened.schedule_roster(s.admin, class.id).await.unwrap();
    assert_eq!(roster.len(), 2);
    assert_eq!(roster[0].id, kept.id);
    assert_eq!(roster[0].status, BookingStatus::Booked);
    assert_eq!(roster[1].status, BookingStatus::Cancelled);
    assert_eq!(reopened.available_slots(class.id).await.unwrap(), 2);
    assert!(matches!(
        reopened.get_schedule(doomed.id).await,
        Err(EngineError::ScheduleNotFound(_))
    ));
    // roles and trainer links come back too
    assert_eq!(reopened.principal(s.trainer_user).trainer_id, Some(s.trainer));
    assert!(matches!(
        reopened.book(client, Ulid::new(), class.id).await,
        Err(EngineError::AlreadyBooked(_))
    ));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let s = Studio::open("durable_compact.wal").await;
    let class = s.class(d(3), t(18, 0), 10).await;
    for _ in 0..5 {
        let c = s.client().await;
        let b = s.engine.book(c, Ulid::new(), class.id).await.unwrap();
        s.engine.cancel(c, b.id).await.unwrap();
    }
    let keeper = s.client().await;
    s.engine.book(keeper, Ulid::new(), class.id).await.unwrap();
    assert!(s.engine.wal_appends_since_compact().await > 0);

    let before = std::fs::metadata(&s.path).unwrap().len();
    s.engine.compact_wal().await.unwrap();
    assert_eq!(s.engine.wal_appends_since_compact().await, 0);
    let after = std::fs::metadata(&s.path).unwrap().len();
    assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

    let reopened = Engine::new(s.path.clone(), s.clock.clone(), StudioTime::utc()).unwrap();
    let roster = reopened.schedule_roster(s.admin, class.id).await.unwrap();
    assert_eq!(roster.len(), 6);
    assert_eq!(reopened.available_slots(class.id).await.unwrap(), 9);
    assert_eq!(reopened.list_styles().len(), 1);
    assert_eq!(reopened.list_trainers().len(), 1);
}

#[tokio::test]
async fn writes_after_compaction_are_kept() {
    let s = Studio::open("durable_compact_append.wal").await;
    let class = s.class(d(3), t(18, 0), 10).await;
    s.engine.compact_wal().await.unwrap();
    let client = s.client().await;
    let b = s.engine.book(client, Ulid::new(), class.id).await.unwrap();

    let reopened = Engine::new(s.path.clone(), s.clock.clone(), StudioTime::utc()).unwrap();
    let roster = reopened.schedule_roster(s.admin, class.id).await.unwrap();
    assert_eq!(roster.len(), 1);
    assert_eq!(roster[0].id, b.id);
}
