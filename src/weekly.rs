use std::collections::HashMap;

use chrono::{Duration, FixedOffset, NaiveDate};

use crate::analysis::local_date;
use crate::models::{
    AlbumBinge, ArtistTime, DailyTotal, DayHighlight, ListeningEvent, WeekSummary, WeeklyPatterns,
};

pub const WEEK_DAYS: i64 = 7;
pub const TOP_ARTIST_LIMIT: usize = 5;
pub const MIN_BINGE_LENGTH: usize = 3;
pub const BINGES_REPORTED: usize = 3;

/// The seven local dates ending at `end`, oldest first.
pub fn week_dates(end: NaiveDate) -> Vec<NaiveDate> {
    (0..WEEK_DAYS)
        .rev()
        .map(|days_ago| end - Duration::days(days_ago))
        .collect()
}

/// Assigns events to local dates. Events outside `dates` are dropped.
pub fn split_by_day(
    events: &[ListeningEvent],
    dates: &[NaiveDate],
    offset: &FixedOffset,
) -> Vec<(NaiveDate, Vec<ListeningEvent>)> {
    let mut days: Vec<(NaiveDate, Vec<ListeningEvent>)> =
        dates.iter().map(|date| (*date, Vec::new())).collect();

    for event in events {
        let date = local_date(&event.played_at, offset);
        if let Some((_, bucket)) = days.iter_mut().find(|(day, _)| *day == date) {
            bucket.push(event.clone());
        }
    }

    days
}

/// `45s`, `3m 20s`, `2h 15m`; zero sub-units are dropped.
pub fn humanize_duration(seconds: f64) -> String {
    let whole = seconds.max(0.0) as u64;
    if whole < 60 {
        format!("{whole}s")
    } else if whole < 3600 {
        let (minutes, secs) = (whole / 60, whole % 60);
        if secs == 0 {
            format!("{minutes}m")
        } else {
            format!("{minutes}m {secs}s")
        }
    } else {
        let (hours, minutes) = (whole / 3600, (whole % 3600) / 60);
        if minutes == 0 {
            format!("{hours}h")
        } else {
            format!("{hours}h {minutes}m")
        }
    }
}

pub fn daily_totals(days: &[(NaiveDate, Vec<ListeningEvent>)]) -> Vec<DailyTotal> {
    days.iter()
        .map(|(date, events)| {
            let total_seconds: f64 = events.iter().map(|event| event.duration).sum();
            DailyTotal {
                date: *date,
                songs: events.len(),
                total_seconds,
                formatted_time: humanize_duration(total_seconds),
            }
        })
        .collect()
}

fn highlight(total: &DailyTotal) -> DayHighlight {
    DayHighlight {
        date: total.date,
        minutes: total.total_minutes(),
        formatted: total.formatted_time.clone(),
        songs: total.songs,
    }
}

pub fn patterns(daily: &[DailyTotal]) -> WeeklyPatterns {
    let total_minutes: f64 = daily.iter().map(DailyTotal::total_minutes).sum();
    let total_songs: usize = daily.iter().map(|day| day.songs).sum();
    let average_minutes = total_minutes / WEEK_DAYS as f64;

    let mut peak: Option<&DailyTotal> = None;
    let mut quietest: Option<&DailyTotal> = None;
    let mut active_days = 0;

    for day in daily.iter().filter(|day| day.total_seconds > 0.0) {
        active_days += 1;
        if peak.map_or(true, |best| day.total_seconds > best.total_seconds) {
            peak = Some(day);
        }
        if quietest.map_or(true, |least| day.total_seconds < least.total_seconds) {
            quietest = Some(day);
        }
    }

    WeeklyPatterns {
        total_minutes,
        total_songs,
        total_formatted: humanize_duration(total_minutes * 60.0),
        average_minutes,
        average_formatted: humanize_duration(average_minutes * 60.0),
        peak_day: peak.map(highlight),
        quietest_day: quietest.map(highlight),
        active_days,
    }
}

/// Artists ranked by total listening time; ties keep first-seen order.
pub fn top_artists(days: &[(NaiveDate, Vec<ListeningEvent>)], limit: usize) -> Vec<ArtistTime> {
    let mut ranked: Vec<ArtistTime> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for event in days.iter().flat_map(|(_, events)| events.iter()) {
        let slot = *index.entry(event.artist.clone()).or_insert_with(|| {
            ranked.push(ArtistTime {
                artist: event.artist.clone(),
                seconds: 0.0,
                songs: 0,
            });
            ranked.len() - 1
        });
        ranked[slot].seconds += event.duration;
        ranked[slot].songs += 1;
    }

    ranked.sort_by(|a, b| b.seconds.total_cmp(&a.seconds));
    ranked.truncate(limit);
    ranked
}

fn close_run(
    date: NaiveDate,
    run: &[&ListeningEvent],
    min_length: usize,
    binges: &mut Vec<AlbumBinge>,
) {
    let Some(first) = run.first() else {
        return;
    };
    if run.len() < min_length {
        return;
    }
    let total_seconds: f64 = run.iter().map(|event| event.duration).sum();
    binges.push(AlbumBinge {
        date,
        album: first.album.clone(),
        artist: first.artist.clone(),
        song_count: run.len(),
        total_seconds,
        formatted_duration: humanize_duration(total_seconds),
    });
}

/// Runs of at least `min_length` consecutive plays from one album, longest
/// listening first. Runs never cross a day boundary.
pub fn album_binges(
    days: &[(NaiveDate, Vec<ListeningEvent>)],
    min_length: usize,
) -> Vec<AlbumBinge> {
    let mut binges = Vec::new();

    for (date, events) in days {
        let mut ordered: Vec<&ListeningEvent> = events.iter().collect();
        ordered.sort_by_key(|event| event.played_at);

        let mut run: Vec<&ListeningEvent> = Vec::new();
        for event in ordered {
            let continues = run
                .last()
                .is_some_and(|last| last.album == event.album && last.artist == event.artist);
            if !continues {
                close_run(*date, &run, min_length, &mut binges);
                run.clear();
            }
            run.push(event);
        }
        close_run(*date, &run, min_length, &mut binges);
    }

    binges.sort_by(|a, b| b.total_seconds.total_cmp(&a.total_seconds));
    binges
}

/// Consecutive days with any listening, counted back from the newest day.
pub fn listening_streak(daily: &[DailyTotal]) -> usize {
    let mut newest_first: Vec<&DailyTotal> = daily.iter().collect();
    newest_first.sort_by(|a, b| b.date.cmp(&a.date));
    newest_first
        .into_iter()
        .take_while(|day| day.total_seconds > 0.0)
        .count()
}

pub fn summarize_week(
    events: &[ListeningEvent],
    end: NaiveDate,
    offset: &FixedOffset,
) -> WeekSummary {
    let dates = week_dates(end);
    let days = split_by_day(events, &dates, offset);
    let daily = daily_totals(&days);

    let mut binges = album_binges(&days, MIN_BINGE_LENGTH);
    binges.truncate(BINGES_REPORTED);

    WeekSummary {
        start_date: dates[0],
        end_date: end,
        patterns: patterns(&daily),
        top_artists: top_artists(&days, TOP_ARTIST_LIMIT),
        album_binges: binges,
        streak: listening_streak(&daily),
        daily,
    }
}
