/// Report printer for `pbsmon stats`.
///
/// The default (fixed) form is for people: a title naming the window, the total number of jobs, and
/// a table with one row per (user, machine), or a line saying there was nothing.  The csv and json
/// forms are for programs and carry only the rows.
use crate::format;

use anyhow::Result;
use pbslog::{Period, Report, ReportRow};
use rustutils::format_date;
use std::collections::HashMap;
use std::io;

pub fn print_report(output: &mut dyn io::Write, report: &Report, fmt: Option<&str>) -> Result<()> {
    let (formatters, aliases) = my_formatters();
    let spec = fmt.unwrap_or(FMT_DEFAULTS);
    let (fields, others) = format::parse_fields(spec, &formatters, &aliases)?;
    let opts = format::standard_options(&others);

    if opts.csv || opts.json {
        return format::format_data(output, &fields, &formatters, &my_labels(), &opts, &report.rows);
    }

    match report.period {
        Period::LastDays(days) => writeln!(
            output,
            "PBS Job Statistics - Last {days} days (since {})",
            format_date(report.window_start)
        )?,
        Period::All => writeln!(
            output,
            "PBS Job Statistics - Complete history (since {})",
            format_date(report.window_start)
        )?,
    }
    writeln!(output, "Total Jobs: {}\n", report.total_job_count)?;
    if report.rows.is_empty() {
        writeln!(output, "No jobs found matching the specified criteria.")?;
        return Ok(());
    }
    format::format_data(output, &fields, &formatters, &my_labels(), &opts, &report.rows)
}

pub fn fmt_help() -> format::Help {
    let (formatters, aliases) = my_formatters();
    format::Help {
        fields: formatters
            .keys()
            .cloned()
            .collect::<Vec<String>>(),
        aliases: aliases
            .into_iter()
            .collect::<Vec<(String, Vec<String>)>>(),
        defaults: FMT_DEFAULTS.to_string(),
    }
}

const FMT_DEFAULTS: &str = "all";

fn my_formatters() -> (
    HashMap<String, &'static dyn Fn(&ReportRow) -> String>,
    HashMap<String, Vec<String>>,
) {
    let mut formatters: HashMap<String, &'static dyn Fn(&ReportRow) -> String> = HashMap::new();
    let mut aliases: HashMap<String, Vec<String>> = HashMap::new();
    formatters.insert("user".to_string(), &format_user);
    formatters.insert("machine".to_string(), &format_machine);
    formatters.insert("jobs".to_string(), &format_jobs);
    formatters.insert("last-run".to_string(), &format_last_run);

    aliases.insert(
        "all".to_string(),
        vec![
            "user".to_string(),
            "machine".to_string(),
            "jobs".to_string(),
            "last-run".to_string(),
        ],
    );

    (formatters, aliases)
}

fn my_labels() -> HashMap<String, &'static str> {
    let mut labels = HashMap::new();
    labels.insert("user".to_string(), "User");
    labels.insert("machine".to_string(), "Machine");
    labels.insert("jobs".to_string(), "Jobs");
    labels.insert("last-run".to_string(), "Last Run");
    labels
}

fn format_user(r: &ReportRow) -> String {
    r.user.to_string()
}

fn format_machine(r: &ReportRow) -> String {
    r.machine.to_string()
}

fn format_jobs(r: &ReportRow) -> String {
    r.count.to_string()
}

fn format_last_run(r: &ReportRow) -> String {
    format_date(r.last_run)
}

#[cfg(test)]
fn sample_report(rows: Vec<ReportRow>) -> Report {
    let now = rustutils::timestamp_from_ymdhms(2024, 10, 14, 12, 0, 0);
    Report {
        period: Period::LastDays(7),
        window_start: rustutils::timestamp_from_ymdhms(2024, 10, 7, 12, 0, 0),
        window_end: now,
        total_job_count: rows.iter().map(|r| r.count).sum(),
        rows,
    }
}

#[cfg(test)]
fn row(user: &str, machine: &str, count: usize, day: u32) -> ReportRow {
    ReportRow {
        user: ustr::Ustr::from(user),
        machine: ustr::Ustr::from(machine),
        count,
        last_run: rustutils::timestamp_from_ymdhms(2024, 10, day, 9, 30, 0),
    }
}

#[cfg(test)]
fn render(report: &Report, fmt: Option<&str>) -> String {
    let mut out = Vec::new();
    print_report(&mut out, report, fmt).unwrap();
    String::from_utf8(out).unwrap()
}

#[test]
fn test_print_fixed() {
    let report = sample_report(vec![
        row("jsmith", "compute-0-8", 3, 14),
        row("bjones", "compute-1-1", 1, 12),
    ]);
    let expected = "PBS Job Statistics - Last 7 days (since 2024-10-07)\n\
                    Total Jobs: 4\n\
                    \n\
                    User    Machine      Jobs  Last Run\n\
                    jsmith  compute-0-8  3     2024-10-14\n\
                    bjones  compute-1-1  1     2024-10-12\n";
    assert!(render(&report, None) == expected);
}

#[test]
fn test_print_empty() {
    let mut report = sample_report(vec![]);
    report.period = Period::All;
    report.window_start = report.window_end;
    let expected = "PBS Job Statistics - Complete history (since 2024-10-14)\n\
                    Total Jobs: 0\n\
                    \n\
                    No jobs found matching the specified criteria.\n";
    assert!(render(&report, None) == expected);
}

#[test]
fn test_print_machine_readable() {
    let report = sample_report(vec![row("jsmith", "compute-0-8", 3, 14)]);
    assert!(render(&report, Some("user,jobs,csv")) == "jsmith,3\n");
    assert!(
        render(&report, Some("all,csv,header"))
            == "user,machine,jobs,last-run\njsmith,compute-0-8,3,2024-10-14\n"
    );
    assert!(
        render(&report, Some("machine,last-run,json"))
            == "[{\"machine\":\"compute-0-8\",\"last-run\":\"2024-10-14\"}]\n"
    );
    let mut out = Vec::new();
    assert!(print_report(&mut out, &report, Some("user,shoesize")).is_err());
}
