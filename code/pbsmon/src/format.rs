/// Formatting for a set of rows presented columnar, as csv, or as json, and (except for json) with or
/// without a header and with or without named fields.
///
/// A `--fmt` spec is a comma-separated list of field names, aliases for lists of field names, and
/// control words (csv, csvnamed, fixed, json, header, noheader).  The fields are looked up in a
/// table of formatters, one per field, each turning a datum into a string.
use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet};
use std::io;

pub struct Help {
    pub fields: Vec<String>,
    pub aliases: Vec<(String, Vec<String>)>,
    pub defaults: String,
}

/// If `fmt` asks for help then print it to `output` and return true.

pub fn maybe_help<F>(output: &mut dyn io::Write, fmt: Option<&str>, f: F) -> Result<bool>
where
    F: Fn() -> Help,
{
    match fmt {
        Some(s) if s.starts_with("help") => {}
        _ => return Ok(false),
    }
    let mut help = f();
    writeln!(output, "Syntax:\n  --fmt=(field|alias|control),...")?;
    writeln!(output, "\nFields:")?;
    help.fields.sort();
    for f in help.fields {
        writeln!(output, "  {f}")?;
    }
    if !help.aliases.is_empty() {
        writeln!(output, "\nAliases:")?;
        help.aliases.sort();
        for (name, mut fields) in help.aliases {
            fields.sort();
            writeln!(output, "  {name} --> {}", fields.join(","))?;
        }
    }
    writeln!(output, "\nDefaults:\n  {}", help.defaults)?;
    writeln!(
        output,
        "\nControl:\n  csv\n  csvnamed\n  fixed\n  json\n  header\n  noheader"
    )?;
    Ok(true)
}

/// Return a vector of the known fields in `spec` wrt the formatters, and a HashSet of any other
/// strings found in `spec`.  It returns an error if zero output fields were selected or if a word
/// is neither a field, an alias, nor a control word.

pub fn parse_fields<'a, DataT, FmtT>(
    spec: &'a str,
    formatters: &HashMap<String, FmtT>,
    aliases: &'a HashMap<String, Vec<String>>,
) -> Result<(Vec<&'a str>, HashSet<&'a str>)>
where
    FmtT: Fn(&DataT) -> String,
{
    let mut others = HashSet::new();
    let mut fields = vec![];
    for x in spec.split(',') {
        if formatters.contains_key(x) {
            fields.push(x);
        } else if let Some(aliases) = aliases.get(x) {
            for alias in aliases {
                if formatters.contains_key(alias) {
                    fields.push(alias.as_ref());
                } else {
                    others.insert(alias.as_ref());
                }
            }
        } else if CONTROL_WORDS.contains(&x) {
            others.insert(x);
        } else {
            bail!("Unknown field or control word '{x}' in --fmt")
        }
    }
    if fields.is_empty() {
        bail!("No output fields were selected")
    }
    Ok((fields, others))
}

const CONTROL_WORDS: [&str; 6] = ["csv", "csvnamed", "fixed", "json", "header", "noheader"];

#[derive(Debug, PartialEq)]
pub struct FormatOptions {
    pub json: bool,   // json explicitly requested
    pub csv: bool,    // csv or csvnamed explicitly requested
    pub fixed: bool,  // fixed output explicitly requested
    pub named: bool,  // csvnamed explicitly requested
    pub header: bool, // true if nothing requested b/c fixed+header is default
}

pub fn standard_options(others: &HashSet<&str>) -> FormatOptions {
    let csvnamed = others.contains("csvnamed");
    let csv = others.contains("csv") || csvnamed;
    let json = others.contains("json") && !csv;
    let fixed = others.contains("fixed") && !csv && !json;
    // json gets no header, even if one is requested
    let header =
        (!csv && !json && !others.contains("noheader")) || (csv && others.contains("header"));
    FormatOptions {
        csv,
        json,
        fixed,
        named: csvnamed,
        header,
    }
}

/// The `fields` are the names of formatting functions to get from the `formatters`, these are
/// applied to the `data`.  The fixed-width header uses the `labels` for the fields that have one
/// and the field name otherwise; csv headers always use the field name.

pub fn format_data<'a, DataT, FmtT>(
    output: &mut dyn io::Write,
    fields: &[&'a str],
    formatters: &HashMap<String, FmtT>,
    labels: &HashMap<String, &'static str>,
    opts: &FormatOptions,
    data: &[DataT],
) -> Result<()>
where
    FmtT: Fn(&DataT) -> String,
{
    let fmts = fields
        .iter()
        .map(|kwd| formatters.get(*kwd))
        .collect::<Option<Vec<&FmtT>>>();
    let Some(fmts) = fmts else {
        bail!("Internal error: field without formatter")
    };
    let rows = data
        .iter()
        .map(|x| fmts.iter().map(|f| f(x)).collect::<Vec<String>>())
        .collect::<Vec<Vec<String>>>();

    if opts.csv {
        format_csv(output, fields, opts, rows)
    } else if opts.json {
        format_json(output, fields, rows)
    } else {
        let headings = fields
            .iter()
            .map(|kwd| labels.get(*kwd).copied().unwrap_or(*kwd))
            .collect::<Vec<&str>>();
        format_fixed_width(output, &headings, opts, rows)
    }
}

fn format_fixed_width(
    output: &mut dyn io::Write,
    headings: &[&str],
    opts: &FormatOptions,
    rows: Vec<Vec<String>>,
) -> Result<()> {
    // The column width is the max across all the entries in the column (including header,
    // if present).
    let mut widths = vec![0; headings.len()];
    if opts.header {
        for (w, h) in widths.iter_mut().zip(headings) {
            *w = usize::max(*w, h.len());
        }
    }
    for row in &rows {
        for (w, val) in widths.iter_mut().zip(row) {
            *w = usize::max(*w, val.len());
        }
    }

    if opts.header {
        write_fixed_line(output, &widths, headings.iter().copied())?;
    }
    for row in &rows {
        write_fixed_line(output, &widths, row.iter().map(|s| s.as_str()))?;
    }
    Ok(())
}

fn write_fixed_line<'a>(
    output: &mut dyn io::Write,
    widths: &[usize],
    vals: impl Iterator<Item = &'a str>,
) -> Result<()> {
    let mut s = "".to_string();
    for (w, val) in widths.iter().zip(vals) {
        let w = *w;
        s += format!("{:w$}  ", val).as_str();
    }
    writeln!(output, "{}", s.trim_end())?;
    Ok(())
}

fn format_csv(
    output: &mut dyn io::Write,
    fields: &[&str],
    opts: &FormatOptions,
    rows: Vec<Vec<String>>,
) -> Result<()> {
    let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(output);

    if opts.header {
        writer.write_record(fields)?;
    }
    for row in rows {
        if opts.named {
            writer.write_record(
                fields
                    .iter()
                    .zip(row)
                    .map(|(kwd, val)| format!("{kwd}={val}")),
            )?;
        } else {
            writer.write_record(row)?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn format_json(output: &mut dyn io::Write, fields: &[&str], rows: Vec<Vec<String>>) -> Result<()> {
    let mut objects = vec![];
    for row in rows {
        let mut obj = json::JsonValue::new_object();
        for (kwd, val) in fields.iter().zip(row) {
            obj[*kwd] = val.into();
        }
        objects.push(obj);
    }
    writeln!(output, "{}", json::stringify(objects))?;
    Ok(())
}

#[cfg(test)]
struct Item {
    name: &'static str,
    n: usize,
}

#[cfg(test)]
fn format_name(d: &Item) -> String {
    d.name.to_string()
}

#[cfg(test)]
fn format_n(d: &Item) -> String {
    d.n.to_string()
}

#[cfg(test)]
fn test_formatters() -> (
    HashMap<String, &'static dyn Fn(&Item) -> String>,
    HashMap<String, Vec<String>>,
) {
    let mut formatters: HashMap<String, &'static dyn Fn(&Item) -> String> = HashMap::new();
    formatters.insert("name".to_string(), &format_name);
    formatters.insert("n".to_string(), &format_n);
    let mut aliases = HashMap::new();
    aliases.insert("all".to_string(), vec!["name".to_string(), "n".to_string()]);
    (formatters, aliases)
}

#[cfg(test)]
fn render(spec: &str) -> String {
    let (formatters, aliases) = test_formatters();
    let (fields, others) = parse_fields(spec, &formatters, &aliases).unwrap();
    let opts = standard_options(&others);
    let mut labels = HashMap::new();
    labels.insert("n".to_string(), "Count");
    let data = [
        Item { name: "alpha", n: 3 },
        Item { name: "b", n: 12 },
    ];
    let mut out = Vec::new();
    format_data(&mut out, &fields, &formatters, &labels, &opts, &data).unwrap();
    String::from_utf8(out).unwrap()
}

#[test]
fn test_format_forms() {
    assert!(render("all") == "name   Count\nalpha  3\nb      12\n");
    assert!(render("n,name,noheader") == "3   alpha\n12  b\n");
    assert!(render("name,csv") == "alpha\nb\n");
    assert!(render("all,csv,header") == "name,n\nalpha,3\nb,12\n");
    assert!(render("all,csvnamed") == "name=alpha,n=3\nname=b,n=12\n");
    assert!(render("all,json") == "[{\"name\":\"alpha\",\"n\":\"3\"},{\"name\":\"b\",\"n\":\"12\"}]\n");
}

#[test]
fn test_parse_fields_errors() {
    let (formatters, aliases) = test_formatters();
    assert!(parse_fields("csv,header", &formatters, &aliases).is_err());
    assert!(parse_fields("name,bogus", &formatters, &aliases).is_err());
}

#[test]
fn test_maybe_help() {
    let help = || Help {
        fields: vec!["b".to_string(), "a".to_string()],
        aliases: vec![],
        defaults: "a,b".to_string(),
    };
    let mut out = Vec::new();
    assert!(!maybe_help(&mut out, Some("a,b"), help).unwrap());
    assert!(!maybe_help(&mut out, None, help).unwrap());
    assert!(out.is_empty());
    assert!(maybe_help(&mut out, Some("help"), help).unwrap());
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("Fields:\n  a\n  b\n"));
}
