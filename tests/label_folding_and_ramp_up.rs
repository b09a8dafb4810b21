use anyhow::Result;
use load_consolidator::{
    AggregatorSettings, ConsolidatingAggregator, RampUpWindow, ReplayReader, Sample,
    OVERALL_LABEL,
};

fn rt(seed: u64) -> f64 {
    0.05 + (seed % 9) as f64 * 0.1
}

fn success_samples() -> Vec<Sample> {
    let rows = [
        (1, "first"),
        (2, "second"),
        (2, "first"),
        (3, "second"),
        (3, "first"),
        (4, "third"),
        (4, "first"),
        (6, "second"),
        (6, "third"),
        (6, "first"),
        (5, "first"),
    ];
    rows.iter()
        .enumerate()
        .map(|(i, &(ts, label))| Sample::new(ts, label, rt(i as u64)))
        .collect()
}

/// Near-identical templated URLs: one shared literal prefix, a query value
/// varying in content and length.
fn templated_url_samples() -> Vec<Sample> {
    (2..200u64)
        .map(|ts| {
            let label = format!(
                "http://blazedemo.example/?r={:0width$x}",
                ts * 37,
                width = 1 + (ts as usize % 16)
            );
            Sample::new(ts, label, rt(ts))
        })
        .collect()
}

#[test]
fn folding_keeps_cumulative_cardinality_bounded() -> Result<()> {
    let mut settings = AggregatorSettings::default();
    settings.track_percentiles = vec![50.0];
    settings.generalize_labels = 25;
    let mut agg = ConsolidatingAggregator::new(settings);
    agg.add_underling(Box::new(ReplayReader::new(success_samples())));
    agg.add_underling(Box::new(ReplayReader::new(templated_url_samples())));
    agg.prepare()?;
    agg.startup()?;
    agg.shutdown()?;
    agg.post_process()?;

    let labels: Vec<&String> = agg.cumulative().keys().collect();
    assert!(
        labels.iter().any(|l| l.as_str() == OVERALL_LABEL),
        "overall bucket always survives folding"
    );
    // ceiling of 25 plus the overall bucket, never below half full
    assert!(labels.len() <= 26, "got {} labels", labels.len());
    assert!(labels.len() >= 13, "got {} labels", labels.len());

    // no samples are lost to folding
    assert_eq!(agg.cumulative()[OVERALL_LABEL].sample_count, 11 + 198);
    Ok(())
}

#[test]
fn distinct_labels_below_ceiling_stay_distinct() -> Result<()> {
    let urls = [
        "http://blazedemo.example/reserve.php",
        "http://blazedemo.example/purchase.php",
        "http://blazedemo.example/vacation.html",
        "http://blazedemo.example/confirmation.php",
        "http://blazedemo.example/another.php",
    ];
    let samples: Vec<Sample> = (2..200u64)
        .map(|ts| Sample::new(ts, urls[ts as usize % urls.len()], rt(ts)))
        .collect();

    let mut settings = AggregatorSettings::default();
    settings.generalize_labels = 25;
    let mut agg = ConsolidatingAggregator::new(settings);
    agg.add_underling(Box::new(ReplayReader::new(samples)));
    agg.prepare()?;
    agg.startup()?;
    agg.shutdown()?;
    agg.post_process()?;

    // five real labels plus the overall bucket
    assert_eq!(agg.cumulative().len(), 6);
    Ok(())
}

#[test]
fn folding_is_reproducible_for_a_given_seed() -> Result<()> {
    let consolidate = || -> Result<Vec<String>> {
        let mut settings = AggregatorSettings::default();
        settings.generalize_labels = 25;
        settings.generalizer_seed = 7;
        let mut agg = ConsolidatingAggregator::new(settings);
        agg.add_underling(Box::new(ReplayReader::new(templated_url_samples())));
        agg.prepare()?;
        agg.startup()?;
        agg.shutdown()?;
        agg.post_process()?;
        Ok(agg.cumulative().keys().cloned().collect())
    };

    assert_eq!(consolidate()?, consolidate()?);
    Ok(())
}

#[test]
fn covering_ramp_up_windows_exclude_everything() -> Result<()> {
    let mut settings = AggregatorSettings::default();
    settings.track_percentiles = vec![50.0];
    settings.ramp_up_exclude = true;
    settings.ramp_up = vec![
        RampUpWindow {
            labels: vec!["first".to_string()],
            duration: 50,
        },
        RampUpWindow {
            labels: vec!["second".to_string()],
            duration: 50,
        },
        RampUpWindow {
            labels: vec!["third".to_string()],
            duration: 50,
        },
    ];
    let mut agg = ConsolidatingAggregator::new(settings);
    agg.add_underling(Box::new(ReplayReader::new(success_samples())));
    agg.prepare()?;
    agg.startup()?;
    agg.shutdown()?;
    agg.post_process()?;

    assert!(agg.cumulative().is_empty());
    Ok(())
}

#[test]
fn ramp_up_only_drops_listed_scenarios() -> Result<()> {
    let mut settings = AggregatorSettings::default();
    settings.ramp_up_exclude = true;
    settings.ramp_up = vec![RampUpWindow {
        labels: vec!["first".to_string(), "second".to_string()],
        duration: 50,
    }];
    let mut agg = ConsolidatingAggregator::new(settings);
    agg.add_underling(Box::new(ReplayReader::new(success_samples())));
    agg.prepare()?;
    agg.startup()?;
    agg.shutdown()?;
    agg.post_process()?;

    let labels: Vec<&str> = agg.cumulative().keys().map(|k| k.as_str()).collect();
    assert_eq!(labels, vec!["", "third"]);
    assert_eq!(agg.cumulative()["third"].sample_count, 2);
    Ok(())
}

#[test]
fn ramp_up_window_expires_mid_run() -> Result<()> {
    let samples: Vec<Sample> = (1..=10u64)
        .map(|ts| Sample::new(ts, "steady", rt(ts)))
        .collect();

    let mut settings = AggregatorSettings::default();
    settings.ramp_up_exclude = true;
    settings.ramp_up = vec![RampUpWindow {
        labels: vec!["steady".to_string()],
        duration: 4,
    }];
    let mut agg = ConsolidatingAggregator::new(settings);
    agg.add_underling(Box::new(ReplayReader::new(samples)));
    agg.prepare()?;
    agg.startup()?;
    agg.shutdown()?;
    agg.post_process()?;

    // seconds 1..=4 fall inside the window, 5..=10 survive
    assert_eq!(agg.cumulative()[OVERALL_LABEL].sample_count, 6);
    Ok(())
}
