// src/pipeline_tests.rs
#[cfg(test)]
mod tests {
    use crate::attendance::{
        AdjustmentReason, ArrivalStatus, AttendanceStatus, DepartureStatus,
    };
    use crate::employee_sync::sync_employees;
    use crate::poller::SyncError;
    use crate::store::{NewPunch, PollStatus};
    use crate::test_support::{
        biotime_employee, d, day_shift_draft, dt, night_shift_draft, raw_punch, FakeSource, Harness,
    };
    use rust_decimal_macros::dec;

    // --- Normalization and classification end to end ---

    #[tokio::test]
    async fn day_shift_punches_become_one_present_record() {
        let source = FakeSource::with_punches(vec![
            raw_punch(1, "1001", "2024-03-04 08:58:00", "0"),
            raw_punch(2, "1001", "2024-03-04 08:59:00", "0"), // repeat scan
            raw_punch(3, "1001", "2024-03-04 17:05:00", "1"),
        ]);
        let h = Harness::new("2024-03-04 18:00:00", source);
        let shift = h.store.create_shift(day_shift_draft()).unwrap();
        h.add_employee("1001", Some(&shift));

        let outcome = h.poller.poll_once().await.unwrap();
        assert_eq!(outcome.fetched, 3);
        assert_eq!(outcome.inserted, 3);
        assert_eq!(outcome.pipeline.punches_processed, 3);
        assert_eq!(outcome.pipeline.records_written, 1);

        let record = h.store.get_attendance("1001", d("2024-03-04")).unwrap().unwrap();
        assert_eq!(record.check_in, Some(dt("2024-03-04 08:58:00")));
        assert_eq!(record.check_out, Some(dt("2024-03-04 17:05:00")));
        assert_eq!(record.punch_count, 2);
        assert_eq!(record.hours_worked, dec!(8.12));
        assert_eq!(record.arrival, Some(ArrivalStatus::OnTime));
        assert_eq!(record.departure, Some(DepartureStatus::OnTime));
        assert_eq!(record.deduction_minutes, 0);
        assert_eq!(record.status, AttendanceStatus::Present);
        assert_eq!(record.shift_id, Some(shift.id));

        assert_eq!(h.store.get_watermark().unwrap(), Some(dt("2024-03-04 18:00:00")));
        let runs = h.store.recent_poll_runs(5).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, PollStatus::Success);
    }

    #[tokio::test]
    async fn repulling_the_same_day_changes_nothing() {
        let source = FakeSource::with_punches(vec![
            raw_punch(1, "1001", "2024-03-04 09:00:00", "0"),
            raw_punch(2, "1001", "2024-03-04 17:00:00", "1"),
        ]);
        let h = Harness::new("2024-03-04 18:00:00", source);
        let shift = h.store.create_shift(day_shift_draft()).unwrap();
        h.add_employee("1001", Some(&shift));

        h.poller.poll_once().await.unwrap();
        let before = h.store.get_attendance("1001", d("2024-03-04")).unwrap();

        let report = h.poller.backfill(d("2024-03-04"), d("2024-03-04")).await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.inserted, 0);
        assert_eq!(report.duplicates, 2);
        assert_eq!(h.store.get_attendance("1001", d("2024-03-04")).unwrap(), before);
    }

    #[tokio::test]
    async fn night_shift_check_out_lands_on_the_start_date() {
        let source = FakeSource::with_punches(vec![
            raw_punch(1, "2002", "2024-03-04 21:55:00", "0"),
            raw_punch(2, "2002", "2024-03-05 06:03:00", "1"),
        ]);
        let h = Harness::new("2024-03-05 12:00:00", source);
        let shift = h.store.create_shift(night_shift_draft()).unwrap();
        h.add_employee("2002", Some(&shift));

        h.poller.poll_once().await.unwrap();

        let record = h.store.get_attendance("2002", d("2024-03-04")).unwrap().unwrap();
        assert_eq!(record.check_in, Some(dt("2024-03-04 21:55:00")));
        assert_eq!(record.check_out, Some(dt("2024-03-05 06:03:00")));
        assert_eq!(record.hours_worked, dec!(8.13));
        assert_eq!(record.departure, Some(DepartureStatus::OnTime));
        assert_eq!(record.status, AttendanceStatus::Present);
        assert!(h.store.attendance_for_date(d("2024-03-05")).unwrap().is_empty());
    }

    // --- Anti-overbilling ---

    #[tokio::test]
    async fn missing_punch_out_is_capped_then_replaced_by_the_real_one() {
        let source = FakeSource::with_punches(vec![raw_punch(1, "1001", "2024-03-04 09:20:00", "0")]);
        let h = Harness::new("2024-03-04 12:00:00", source);
        let shift = h.store.create_shift(day_shift_draft()).unwrap();
        h.add_employee("1001", Some(&shift));

        h.poller.poll_once().await.unwrap();
        let open = h.store.get_attendance("1001", d("2024-03-04")).unwrap().unwrap();
        assert_eq!(open.status, AttendanceStatus::Incomplete);
        assert_eq!(open.arrival, Some(ArrivalStatus::Late));
        assert_eq!(open.deduction_minutes, 20);

        // Past shift end + grace.
        h.clock.set_time("2024-03-04 19:30:00");
        let report = h.pipeline.process_pending().unwrap();
        assert_eq!(report.auto_punched_out, 1);

        let capped = h.store.get_attendance("1001", d("2024-03-04")).unwrap().unwrap();
        assert_eq!(capped.status, AttendanceStatus::AutoPunchedOut);
        assert_eq!(capped.check_out, Some(dt("2024-03-04 17:00:00")));
        assert_eq!(capped.hours_worked, dec!(7.67));
        let adjustment = capped.adjustment.unwrap();
        assert_eq!(adjustment.reason, AdjustmentReason::MissingPunchOut);
        assert_eq!(adjustment.applied_at, dt("2024-03-04 19:30:00"));

        // The terminal was offline; its punch-out shows up later via backfill.
        h.source.push(raw_punch(2, "1001", "2024-03-04 18:10:00", "1"));
        let backfill = h.poller.backfill(d("2024-03-04"), d("2024-03-04")).await.unwrap();
        assert_eq!(backfill.inserted, 1);

        let real = h.store.get_attendance("1001", d("2024-03-04")).unwrap().unwrap();
        assert_eq!(real.status, AttendanceStatus::Present);
        assert_eq!(real.check_out, Some(dt("2024-03-04 18:10:00")));
        assert_eq!(real.hours_worked, dec!(8.83));
        assert_eq!(real.departure, Some(DepartureStatus::Overtime));
        assert_eq!(real.overtime_minutes, 70);
        assert!(real.adjustment.is_none());
    }

    #[tokio::test]
    async fn unscheduled_marathon_day_is_capped() {
        let source = FakeSource::with_punches(vec![
            raw_punch(1, "4004", "2024-03-09 08:00:00", "0"),
            raw_punch(2, "4004", "2024-03-09 23:30:00", "1"),
        ]);
        let h = Harness::new("2024-03-09 23:45:00", source);

        let outcome = h.poller.poll_once().await.unwrap();
        assert_eq!(outcome.pipeline.hours_capped, 1);

        let record = h.store.get_attendance("4004", d("2024-03-09")).unwrap().unwrap();
        assert_eq!(record.status, AttendanceStatus::Unscheduled);
        assert_eq!(record.hours_worked, dec!(12));
        let adjustment = record.adjustment.unwrap();
        assert_eq!(adjustment.reason, AdjustmentReason::ExcessiveHours);
        assert_eq!(adjustment.original_hours, dec!(15.5));
    }

    // --- Absences and reprocessing ---

    #[tokio::test]
    async fn scheduled_employee_without_punches_is_marked_absent() {
        let source = FakeSource::with_punches(vec![
            raw_punch(1, "1001", "2024-03-04 09:00:00", "0"),
            raw_punch(2, "1001", "2024-03-04 17:00:00", "1"),
        ]);
        let h = Harness::new("2024-03-05 08:00:00", source);
        let shift = h.store.create_shift(day_shift_draft()).unwrap();
        h.add_employee("1001", Some(&shift));
        h.add_employee("3003", Some(&shift));
        h.add_employee("5005", None);

        let outcome = h.poller.poll_once().await.unwrap();
        assert_eq!(outcome.pipeline.absences_marked, 1);

        let absent = h.store.get_attendance("3003", d("2024-03-04")).unwrap().unwrap();
        assert_eq!(absent.status, AttendanceStatus::Absent);
        assert_eq!(absent.shift_id, Some(shift.id));
        assert_eq!(absent.check_in, None);
        assert!(h.store.get_attendance("5005", d("2024-03-04")).unwrap().is_none());

        // Running again does not duplicate anything.
        assert_eq!(h.pipeline.process_pending().unwrap().absences_marked, 0);
    }

    #[tokio::test]
    async fn reprocessing_applies_a_late_shift_assignment() {
        let source = FakeSource::with_punches(vec![
            raw_punch(1, "1001", "2024-03-04 09:30:00", "0"),
            raw_punch(2, "1001", "2024-03-04 17:00:00", "1"),
        ]);
        let h = Harness::new("2024-03-04 18:00:00", source);
        h.add_employee("1001", None);

        h.poller.poll_once().await.unwrap();
        let unscheduled = h.store.get_attendance("1001", d("2024-03-04")).unwrap().unwrap();
        assert_eq!(unscheduled.status, AttendanceStatus::Unscheduled);

        let shift = h.store.create_shift(day_shift_draft()).unwrap();
        h.add_employee("1001", Some(&shift));
        let report = h.pipeline.reprocess_range(d("2024-03-04"), d("2024-03-04")).unwrap();
        assert_eq!(report.records_written, 1);
        assert_eq!(report.punches_processed, 0);

        let scheduled = h.store.get_attendance("1001", d("2024-03-04")).unwrap().unwrap();
        assert_eq!(scheduled.status, AttendanceStatus::Present);
        assert_eq!(scheduled.arrival, Some(ArrivalStatus::Late));
        assert_eq!(scheduled.deduction_minutes, 30);
    }

    #[tokio::test]
    async fn late_night_shift_assignment_moves_the_check_out_back_a_day() {
        let source = FakeSource::with_punches(vec![
            raw_punch(1, "2002", "2024-03-04 21:55:00", "0"),
            raw_punch(2, "2002", "2024-03-05 06:03:00", "1"),
        ]);
        let h = Harness::new("2024-03-05 10:00:00", source);
        h.add_employee("2002", None);

        h.poller.poll_once().await.unwrap();
        assert_eq!(h.store.attendance_for_employee("2002", d("2024-03-04"), d("2024-03-05")).unwrap().len(), 2);

        let shift = h.store.create_shift(night_shift_draft()).unwrap();
        h.add_employee("2002", Some(&shift));
        let report = h.pipeline.reprocess_range(d("2024-03-04"), d("2024-03-05")).unwrap();
        assert_eq!(report.records_written, 1);
        assert_eq!(report.records_removed, 1);

        let night = h.store.get_attendance("2002", d("2024-03-04")).unwrap().unwrap();
        assert_eq!(night.check_out, Some(dt("2024-03-05 06:03:00")));
        assert_eq!(night.hours_worked, dec!(8.13));
        assert_eq!(night.status, AttendanceStatus::Present);
        assert!(h.store.get_attendance("2002", d("2024-03-05")).unwrap().is_none());

        // The next day's sweep must not bill the vanished row.
        h.clock.set_time("2024-03-06 12:00:00");
        let report = h.pipeline.process_pending().unwrap();
        assert_eq!(report.auto_punched_out, 0);
        let next = h.store.get_attendance("2002", d("2024-03-05")).unwrap().unwrap();
        assert_eq!(next.status, AttendanceStatus::Absent);
        assert_eq!(next.hours_worked, dec!(0));

        // Reprocessing again is a no-op.
        let again = h.pipeline.reprocess_range(d("2024-03-04"), d("2024-03-05")).unwrap();
        assert_eq!(again.records_removed, 0);
        assert_eq!(h.store.get_attendance("2002", d("2024-03-04")).unwrap().unwrap().hours_worked, dec!(8.13));
    }

    // --- Poller behaviour ---

    #[tokio::test]
    async fn transient_failures_are_retried_and_watermark_follows_success() {
        let source = FakeSource::with_punches(vec![raw_punch(1, "1001", "2024-03-04 09:00:00", "0")]);
        let h = Harness::new("2024-03-04 10:00:00", source);

        h.source.fail_next(2);
        h.poller.poll_once().await.unwrap();
        assert_eq!(h.source.call_count(), 3);
        assert_eq!(h.store.get_watermark().unwrap(), Some(dt("2024-03-04 10:00:00")));

        // Next window overlaps the watermark by ten minutes.
        h.clock.set_time("2024-03-04 10:05:00");
        h.source.fail_next(3);
        let err = h.poller.poll_once().await.unwrap_err();
        assert!(matches!(err, SyncError::Source(_)));
        assert_eq!(
            h.source.calls.lock().unwrap().last().copied(),
            Some((dt("2024-03-04 09:50:00"), dt("2024-03-04 10:05:00")))
        );
        assert_eq!(h.store.get_watermark().unwrap(), Some(dt("2024-03-04 10:00:00")));

        let runs = h.store.recent_poll_runs(5).unwrap();
        assert_eq!(runs[0].status, PollStatus::Failed);
        assert!(runs[0].error.as_deref().unwrap().contains("maintenance"));
    }

    #[tokio::test]
    async fn staging_failure_is_recorded_as_a_failed_poll() {
        let source = FakeSource::with_punches(vec![raw_punch(1, "1001", "2024-03-04 09:00:00", "0")]);
        let h = Harness::new("2024-03-04 10:00:00", source);
        h.store
            .execute_sql(
                "CREATE TRIGGER refuse_staging BEFORE INSERT ON staged_punches
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();

        let err = h.poller.poll_once().await.unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));
        assert_eq!(h.store.get_watermark().unwrap(), None);

        let runs = h.store.recent_poll_runs(5).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, PollStatus::Failed);
        assert_eq!(runs[0].fetched, 1);
        assert!(runs[0].error.as_deref().unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let h = Harness::new("2024-03-04 10:00:00", FakeSource::default());
        h.source.set_permanent_failure(true);
        assert!(h.poller.poll_once().await.is_err());
        assert_eq!(h.source.call_count(), 1);
    }

    #[tokio::test]
    async fn backfill_reports_failed_chunks_without_moving_watermark() {
        let h = Harness::new("2024-03-10 10:00:00", FakeSource::default());
        h.source.set_permanent_failure(true);

        let report = h.poller.backfill(d("2024-03-04"), d("2024-03-06")).await.unwrap();
        assert_eq!(report.chunks, 3);
        assert_eq!(report.failed_chunks.len(), 3);
        assert_eq!(report.failed_chunks[0].start, dt("2024-03-04 00:00:00"));
        assert_eq!(report.failed_chunks[0].end, dt("2024-03-04 23:59:59"));
        assert_eq!(h.store.get_watermark().unwrap(), None);

        assert!(matches!(
            h.poller.backfill(d("2024-03-06"), d("2024-03-04")).await,
            Err(SyncError::InvalidRange { .. })
        ));
    }

    #[tokio::test]
    async fn gaps_are_found_and_recovered() {
        let source = FakeSource::with_punches(vec![
            raw_punch(1, "1001", "2024-03-04 09:00:00", "0"),
            raw_punch(2, "1001", "2024-03-05 09:00:00", "0"),
            raw_punch(3, "1001", "2024-03-06 09:00:00", "0"),
        ]);
        let h = Harness::new("2024-03-11 09:00:00", source);
        let shift = h.store.create_shift(day_shift_draft()).unwrap();
        h.add_employee("1001", Some(&shift));

        // Only Monday and Wednesday made it into staging before the outage.
        let staged: Vec<NewPunch> = [
            raw_punch(1, "1001", "2024-03-04 09:00:00", "0"),
            raw_punch(3, "1001", "2024-03-06 09:00:00", "0"),
        ]
        .iter()
        .map(|p| NewPunch::from_raw(p).unwrap())
        .collect();
        h.store.stage_punches(&staged, dt("2024-03-06 10:00:00")).unwrap();

        let gaps = h.poller.find_gaps(d("2024-03-04"), d("2024-03-10")).unwrap();
        assert_eq!(gaps, vec![d("2024-03-05"), d("2024-03-07"), d("2024-03-08")]);

        let recovery = h.poller.recover_gaps(d("2024-03-04"), d("2024-03-10")).await.unwrap();
        assert_eq!(recovery.gaps, gaps);
        assert_eq!(recovery.backfill.chunks, 3);
        assert_eq!(recovery.backfill.inserted, 1);

        let remaining = h.poller.find_gaps(d("2024-03-04"), d("2024-03-10")).unwrap();
        assert_eq!(remaining, vec![d("2024-03-07"), d("2024-03-08")]);
    }

    // --- Employee directory ---

    #[tokio::test]
    async fn shared_cnic_is_flagged_not_merged() {
        let h = Harness::new("2024-03-04 10:00:00", FakeSource::default());
        h.source.set_employees(vec![
            biotime_employee(1, "1001", Some("3520212345671")),
            biotime_employee(2, "1002", Some("35202-1234567-1")),
            biotime_employee(3, "1003", Some("12-34")),
        ]);

        let report = sync_employees(h.source.as_ref(), &h.store, &h.clock).await.unwrap();
        assert_eq!(report.fetched, 3);
        assert_eq!(report.upserted, 3);
        assert_eq!(report.invalid_cnic, 1);
        assert_eq!(report.new_conflicts, 1);

        let conflicts = h.store.list_identity_conflicts().unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].cnic, "35202-1234567-1");
        assert_eq!(conflicts[0].emp_code, "1002");
        assert_eq!(conflicts[0].existing_emp_code, "1001");

        let employees = h.store.list_employees().unwrap();
        assert_eq!(employees.len(), 3);
        assert_eq!(employees[2].cnic, None);

        let again = sync_employees(h.source.as_ref(), &h.store, &h.clock).await.unwrap();
        assert_eq!(again.new_conflicts, 0);
    }
}
