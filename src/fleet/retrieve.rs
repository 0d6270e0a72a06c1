//! Artifact retrieval, remote cleanup and metric export.
//!
//! Everything pulled back from a unit lands under
//! `<local_base>/<fleet><ordinal>/`, mirroring the remote path with its
//! leading slash removed.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tracing::{debug, info, warn};

use crate::config::{DELETE_FILES_PARAM, METRICS_PARAM, RETRIEVE_FILES_PARAM};
use crate::error::FleetError;
use crate::gateway::{Datapoint, MetricQuery};
use crate::ids::ProviderId;
use crate::transport::shell_pattern;

use super::{FanOutReport, Fleet, UnitOutcome};

const METRICS_CSV_HEADER: &str = "Timestamp,Metric,Statistic,Value,Unit";

impl Fleet {
    /// Local directory holding the artifacts of the unit at `ordinal`.
    #[must_use]
    pub fn unit_dir(&self, local_base: &Utf8Path, ordinal: usize) -> Utf8PathBuf {
        local_base.join(format!("{}{ordinal}", self.name()))
    }

    /// Downloads the files listed in the `RETRIEVE_FILES` parameter from
    /// every unit. Relative paths are resolved against `remote_base`.
    pub async fn retrieve_files(
        &mut self,
        local_base: &Utf8Path,
        remote_base: &str,
    ) -> FanOutReport<Vec<Utf8PathBuf>> {
        let files = self.spec.list_parameter(RETRIEVE_FILES_PARAM);
        if files.is_empty() {
            debug!(fleet = self.name(), "no files to retrieve");
            return FanOutReport::default();
        }
        self.retrieve_file_list(&files, local_base, remote_base).await
    }

    /// Downloads `files` from every unit. Remote paths may contain `*`, `?`
    /// and `[...]` wildcards. Missing remote files are skipped.
    pub async fn retrieve_file_list(
        &mut self,
        files: &[String],
        local_base: &Utf8Path,
        remote_base: &str,
    ) -> FanOutReport<Vec<Utf8PathBuf>> {
        let mut outcomes = Vec::with_capacity(self.units.len());
        for index in 0..self.units.len() {
            let ordinal = index + 1;
            let unit_dir = self.unit_dir(local_base, ordinal);
            let Some(unit) = self.units.get_mut(index) else {
                break;
            };

            let mut received = Vec::new();
            let mut failure = None;
            for file in files {
                let remote = remote_path(remote_base, file);
                let local = unit_dir.join(file.trim_start_matches('/'));
                match unit.receive_file(&remote, &local).await {
                    Ok(paths) => received.extend(paths),
                    Err(err) => {
                        warn!(unit = %unit.label(), remote = %remote, error = %err, "retrieval failed");
                        failure = Some(FleetError::from(err));
                        break;
                    }
                }
            }

            outcomes.push(UnitOutcome {
                ordinal,
                provider_id: unit.provider_id().cloned(),
                result: failure.map_or(Ok(received), Err),
            });
        }

        let report = FanOutReport::new(outcomes);
        info!(
            fleet = self.name(),
            files = report.successes().map(|(_, paths)| paths.len()).sum::<usize>(),
            failures = report.failures().count(),
            "retrieved files"
        );
        report
    }

    /// Removes the paths listed in the `DELETE_FILES` parameter on every unit.
    pub async fn delete_files(&mut self) -> FanOutReport<Vec<String>> {
        let files = self.spec.list_parameter(DELETE_FILES_PARAM);
        self.delete_file_list(&files).await
    }

    /// Runs `rm -rf` over `files` on every unit. An empty list does nothing.
    pub async fn delete_file_list(&mut self, files: &[String]) -> FanOutReport<Vec<String>> {
        if files.is_empty() {
            debug!(fleet = self.name(), "no files to delete");
            return FanOutReport::default();
        }
        self.exec_on_all(&removal_command(files)).await
    }

    /// Exports the metrics listed in the `METRICS` parameter for every unit
    /// as `<metric>.csv` in the unit's artifact directory.
    pub async fn retrieve_metrics(
        &self,
        local_base: &Utf8Path,
        query: &MetricQuery,
    ) -> FanOutReport<Vec<Utf8PathBuf>> {
        let metrics = self.spec.list_parameter(METRICS_PARAM);
        if metrics.is_empty() {
            debug!(fleet = self.name(), "no metrics to export");
            return FanOutReport::default();
        }

        let mut outcomes = Vec::with_capacity(self.units.len());
        for (index, unit) in self.units.iter().enumerate() {
            let ordinal = index + 1;
            let unit_dir = self.unit_dir(local_base, ordinal);
            let result = self
                .export_unit_metrics(unit.provider_id(), ordinal, &unit_dir, &metrics, query)
                .await;
            if let Err(err) = &result {
                warn!(fleet = self.name(), ordinal, error = %err, "metric export failed");
            }
            outcomes.push(UnitOutcome {
                ordinal,
                provider_id: unit.provider_id().cloned(),
                result,
            });
        }
        FanOutReport::new(outcomes)
    }

    async fn export_unit_metrics(
        &self,
        unit_id: Option<&ProviderId>,
        ordinal: usize,
        unit_dir: &Utf8Path,
        metrics: &[String],
        query: &MetricQuery,
    ) -> Result<Vec<Utf8PathBuf>, FleetError> {
        let provider_id = unit_id.ok_or_else(|| FleetError::NotLaunched {
            fleet: self.name().to_owned(),
            ordinal,
        })?;

        Dir::create_ambient_dir_all(unit_dir, ambient_authority())
            .map_err(|err| FleetError::io(unit_dir, &err))?;
        let dir = Dir::open_ambient_dir(unit_dir, ambient_authority())
            .map_err(|err| FleetError::io(unit_dir, &err))?;

        let mut written = Vec::with_capacity(metrics.len());
        for metric in metrics {
            let metric_query = query.for_metric(metric);
            let samples = self
                .ctx
                .gateway
                .unit_metrics(provider_id, &metric_query)
                .await?;
            let file_name = format!("{metric}.csv");
            let path = unit_dir.join(&file_name);
            dir.write(&file_name, metrics_csv(&metric_query, &samples))
                .map_err(|err| FleetError::io(&path, &err))?;
            debug!(provider_id = %provider_id, metric = %metric, samples = samples.len(), "exported metric");
            written.push(path);
        }
        Ok(written)
    }
}

fn remote_path(remote_base: &str, file: &str) -> String {
    if file.starts_with('/') || remote_base.trim().is_empty() {
        file.to_owned()
    } else {
        format!("{}/{file}", remote_base.trim_end_matches('/'))
    }
}

fn removal_command(files: &[String]) -> String {
    let mut command = String::from("rm -rf");
    for file in files {
        command.push(' ');
        command.push_str(&shell_pattern(file));
    }
    command
}

fn metrics_csv(query: &MetricQuery, samples: &[Datapoint]) -> String {
    let mut csv = String::from(METRICS_CSV_HEADER);
    csv.push('\n');
    for sample in samples {
        csv.push_str(&format!(
            "{},{},{},{:.3},{}\n",
            sample.timestamp_ms,
            query.metric,
            query.statistic.as_str(),
            sample.value,
            sample.unit
        ));
    }
    csv
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;
    use crate::gateway::Statistic;

    #[rstest]
    #[case("/srv/app", "app.log", "/srv/app/app.log")]
    #[case("/srv/app/", "logs/*.log", "/srv/app/logs/*.log")]
    #[case("/srv/app", "/var/log/x.log", "/var/log/x.log")]
    #[case("", "app.log", "app.log")]
    fn resolves_remote_paths(#[case] base: &str, #[case] file: &str, #[case] expected: &str) {
        assert_eq!(remote_path(base, file), expected);
    }

    #[test]
    fn removal_command_escapes_each_path() {
        let files = vec![String::from("/tmp/out"), String::from("/tmp/my data")];
        assert_eq!(removal_command(&files), "rm -rf /tmp/out '/tmp/my data'");
    }

    #[rstest]
    #[case("/tmp/results/*.jtl", "rm -rf /tmp/results/*.jtl")]
    #[case("/tmp/run-?/out", "rm -rf /tmp/run-?/out")]
    #[case("/tmp/my dir/[ab]*.log", "rm -rf '/tmp/my dir/'[ab]*.log")]
    fn removal_command_keeps_wildcards_live(#[case] file: &str, #[case] expected: &str) {
        assert_eq!(removal_command(&[file.to_owned()]), expected);
    }

    #[test]
    fn csv_has_header_and_three_decimals() {
        let query = MetricQuery::new(
            "CPUUtilization",
            Duration::from_secs(3600),
            Duration::from_secs(300),
            Statistic::Maximum,
        );
        let samples = vec![Datapoint {
            timestamp_ms: 1_700_000_000_000,
            value: 12.5,
            unit: String::from("Percent"),
        }];
        assert_eq!(
            metrics_csv(&query, &samples),
            "Timestamp,Metric,Statistic,Value,Unit\n1700000000000,CPUUtilization,Maximum,12.500,Percent\n"
        );
    }
}
