use std::collections::HashMap;
use std::hash::Hash;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};

use crate::models::{DaySummary, HourBucket, HourSlot, ListeningEvent, PeakHour, PlayCount};

/// How many multiply-played songs, artists and albums a day reports.
pub const TOP_N: usize = 3;

pub fn hour_label(instant: &DateTime<Utc>, offset: &FixedOffset) -> String {
    instant.with_timezone(offset).format("%H:00").to_string()
}

pub fn local_date(instant: &DateTime<Utc>, offset: &FixedOffset) -> NaiveDate {
    instant.with_timezone(offset).date_naive()
}

/// UTC bounds `[start, end)` of one local calendar day.
pub fn local_day_bounds(date: NaiveDate, offset: &FixedOffset) -> (DateTime<Utc>, DateTime<Utc>) {
    let midnight = date.and_time(NaiveTime::default());
    let start = offset
        .from_local_datetime(&midnight)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&midnight));
    (start, start + Duration::days(1))
}

/// Buckets events by local hour. Buckets appear in the order their first
/// event was seen, events keep their input order inside a bucket.
pub fn group_by_hour(events: &[ListeningEvent], offset: &FixedOffset) -> Vec<HourBucket> {
    let mut buckets: Vec<HourBucket> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for event in events {
        let label = hour_label(&event.played_at, offset);
        let slot = *index.entry(label.clone()).or_insert_with(|| {
            buckets.push(HourBucket::new(label));
            buckets.len() - 1
        });
        buckets[slot].push(event.clone());
    }

    buckets
}

/// `M:SS`
pub fn format_minutes(seconds: u64) -> String {
    let (minutes, seconds) = (seconds / 60, seconds % 60);
    format!("{minutes}:{seconds:02}")
}

/// `H:MM:SS`
pub fn format_clock(seconds: u64) -> String {
    let (hours, remainder) = (seconds / 3600, seconds % 3600);
    let (minutes, seconds) = (remainder / 60, remainder % 60);
    format!("{hours}:{minutes:02}:{seconds:02}")
}

pub fn format_verbose(seconds: u64) -> String {
    let (hours, remainder) = (seconds / 3600, seconds % 3600);
    let (minutes, seconds) = (remainder / 60, remainder % 60);
    if hours > 0 {
        format!("{hours} hours, {minutes} minutes, and {seconds} seconds")
    } else if minutes > 0 {
        format!("{minutes} minutes and {seconds} seconds")
    } else {
        format!("{seconds} seconds")
    }
}

/// `(title, artist)`: two songs with the same title are different songs.
pub fn song_key(event: &ListeningEvent) -> (String, String) {
    (event.title.clone(), event.artist.clone())
}

pub fn album_key(event: &ListeningEvent) -> (String, String) {
    (event.album.clone(), event.artist.clone())
}

pub fn artist_key(event: &ListeningEvent) -> String {
    event.artist.clone()
}

fn by_artist((name, artist): &(String, String)) -> String {
    format!("{name} by {artist}")
}

/// Items played more than once, most played first. The sort is stable over
/// first-seen order, so ties keep the order in which they were encountered.
/// Counting happens on `key`; `label` only renders the result.
pub fn multi_played<K, F, L>(buckets: &[HourBucket], key: F, label: L) -> Vec<PlayCount>
where
    K: Eq + Hash + Clone,
    F: Fn(&ListeningEvent) -> K,
    L: Fn(&K) -> String,
{
    let mut seen: Vec<K> = Vec::new();
    let mut counts: HashMap<K, usize> = HashMap::new();

    for event in buckets.iter().flat_map(|bucket| bucket.events.iter()) {
        let item = key(event);
        let count = counts.entry(item.clone()).or_insert(0);
        if *count == 0 {
            seen.push(item);
        }
        *count += 1;
    }

    let mut items: Vec<PlayCount> = seen
        .into_iter()
        .filter_map(|item| {
            let count = counts.get(&item).copied().unwrap_or(0);
            (count > 1).then(|| PlayCount {
                label: label(&item),
                count,
            })
        })
        .collect();
    items.sort_by(|a, b| b.count.cmp(&a.count));
    items
}

fn top(items: Vec<PlayCount>) -> Vec<PlayCount> {
    items.into_iter().take(TOP_N).collect()
}

/// Bucket with the most listening as `minutes_listened` shows it; the
/// earliest bucket wins a tie.
pub fn peak_hour(buckets: &[HourBucket]) -> Option<PeakHour> {
    let mut best: Option<&HourBucket> = None;
    for bucket in buckets {
        if best.map_or(true, |current| bucket.whole_seconds() > current.whole_seconds()) {
            best = Some(bucket);
        }
    }
    best.map(|bucket| PeakHour {
        label: bucket.label.clone(),
        seconds: bucket.whole_seconds(),
        minutes_listened: bucket.minutes_listened(),
    })
}

/// Highest popularity; the first event wins a tie.
pub fn most_popular(buckets: &[HourBucket]) -> Option<ListeningEvent> {
    let mut best: Option<&ListeningEvent> = None;
    for event in buckets.iter().flat_map(|bucket| bucket.events.iter()) {
        if best.map_or(true, |current| event.popularity > current.popularity) {
            best = Some(event);
        }
    }
    best.cloned()
}

/// Duration-weighted mean of a 0..1 feature as a percentage with one
/// decimal. Events without the feature count for neither side.
pub fn weighted_level<F>(events: &[ListeningEvent], feature: F) -> f64
where
    F: Fn(&ListeningEvent) -> Option<f64>,
{
    let mut weighted = 0.0;
    let mut total_duration = 0.0;

    for event in events {
        let Some(value) = feature(event) else {
            continue;
        };
        weighted += value * event.duration;
        total_duration += event.duration;
    }

    if total_duration <= 0.0 {
        return 0.0;
    }
    ((weighted / total_duration) * 1000.0).round() / 10.0
}

pub fn energy_level(events: &[ListeningEvent]) -> f64 {
    weighted_level(events, |event| event.energy)
}

pub fn mood_level(events: &[ListeningEvent]) -> f64 {
    weighted_level(events, |event| event.valence)
}

pub fn summarize_day(events: &[ListeningEvent], offset: &FixedOffset) -> DaySummary {
    let buckets = group_by_hour(events, offset);
    let total_seconds: u64 = buckets.iter().map(HourBucket::whole_seconds).sum();

    DaySummary {
        total_songs: events.len(),
        total_seconds,
        total_time: format_clock(total_seconds),
        total_time_verbose: format_verbose(total_seconds),
        hours: buckets.iter().map(HourSlot::from).collect(),
        top_songs: top(multi_played(&buckets, song_key, by_artist)),
        top_artists: top(multi_played(&buckets, artist_key, String::clone)),
        top_albums: top(multi_played(&buckets, album_key, by_artist)),
        most_popular: most_popular(&buckets),
        peak_hour: peak_hour(&buckets),
        energy_level: energy_level(events),
        mood_level: mood_level(events),
    }
}
