use std::env;
use std::io::{self, Write};
use std::path::PathBuf;

use formula_xls_records::{
    load_workbook_stream, read_workbook_stream_from_xls, workbook_stream_to_vec, DocumentGraph,
    Entry, LoadOptions, RecordFactory, SaveOptions, Substream,
};

#[derive(Debug)]
struct Args {
    path: PathBuf,
    validate: bool,
    roundtrip: bool,
    max: Option<usize>,
}

impl Args {
    fn parse() -> Result<Self, io::Error> {
        let mut path: Option<PathBuf> = None;
        let mut validate = false;
        let mut roundtrip = false;
        let mut max: Option<usize> = None;

        let mut it = env::args().skip(1);
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "-h" | "--help" => {
                    print_usage();
                    std::process::exit(0);
                }
                "--validate" => validate = true,
                "--roundtrip" => roundtrip = true,
                "--max" => {
                    let value = it
                        .next()
                        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "--max expects <n>"))?;
                    max = Some(parse_max(&value)?);
                }
                _ if arg.starts_with("--max=") => {
                    max = Some(parse_max(&arg["--max=".len()..])?);
                }
                _ if arg.starts_with('-') => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("unknown option: {arg}"),
                    ));
                }
                _ => {
                    if path.is_some() {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            format!("unexpected argument: {arg}"),
                        ));
                    }
                    path = Some(PathBuf::from(arg));
                }
            }
        }

        let path = path.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing <path.xls>"))?;
        Ok(Self {
            path,
            validate,
            roundtrip,
            max,
        })
    }
}

fn parse_max(value: &str) -> Result<usize, io::Error> {
    value.parse().map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("invalid --max value: {value}"))
    })
}

fn print_usage() {
    println!(
        "\
xls-record-dump: print the BIFF8 record structure of an .xls workbook stream

Usage:
  xls-record-dump <path.xls> [--validate] [--roundtrip] [--max <n>]

Options:
  --validate     Repair missing/out-of-order records before printing
  --roundtrip    Save the loaded graph, reload it, and compare logical records
  --max <n>      Limit printed records (diagnostics are always printed)
"
    );
}

fn main() {
    if let Err(err) = run() {
        eprintln!("xls-record-dump: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse()?;
    let stream = read_workbook_stream_from_xls(&args.path)?;
    let options = if args.validate {
        LoadOptions::defensive()
    } else {
        LoadOptions::default()
    };
    let loaded = load_workbook_stream(&stream[..], &options)?;

    let factory = RecordFactory::new();
    let mut out = io::BufWriter::new(io::stdout());
    let mut budget = args.max.unwrap_or(usize::MAX);

    for (index, substream) in loaded.graph.substreams().enumerate() {
        let label = if index == 0 {
            "globals".to_string()
        } else {
            format!("sheet {}", index - 1)
        };
        dump_substream(&mut out, &factory, &label, substream, 0, &mut budget)?;
    }
    if let Some(offset) = loaded.trailing_junk_offset {
        writeln!(out, "padding from offset {offset}")?;
    }

    writeln!(out, "{} diagnostics", loaded.diagnostics.len())?;
    for diagnostic in &loaded.diagnostics {
        writeln!(out, "  {diagnostic}")?;
    }

    if args.roundtrip {
        let mut graph = loaded.graph.clone();
        let saved = workbook_stream_to_vec(&mut graph, &SaveOptions::default())?;
        let reloaded = load_workbook_stream(&saved[..], &options)?;
        match first_difference(&graph, &reloaded.graph) {
            None => writeln!(out, "roundtrip: ok ({} bytes)", saved.len())?,
            Some(index) => writeln!(out, "roundtrip: logical record {index} differs")?,
        }
    }
    out.flush()?;
    Ok(())
}

fn dump_substream(
    out: &mut impl Write,
    factory: &RecordFactory,
    label: &str,
    substream: &Substream,
    depth: usize,
    budget: &mut usize,
) -> io::Result<()> {
    let indent = "  ".repeat(depth);
    writeln!(out, "{indent}{label} {:?}", substream.kind)?;
    for entry in substream.entries() {
        match *entry {
            Entry::Record(id) => {
                let Some(record) = substream.record(id) else {
                    continue;
                };
                if *budget == 0 {
                    continue;
                }
                *budget -= 1;
                let offset = record
                    .offset
                    .map_or_else(|| "synth".to_string(), |offset| offset.to_string());
                let masked = if record.is_masked() { " (masked CONTINUE)" } else { "" };
                writeln!(
                    out,
                    "{indent}  {offset:>10}  0x{:04X} {:<16} len={} fragments={}{masked}",
                    record.opcode,
                    factory.name(record.opcode).unwrap_or("?"),
                    record.payload().len(),
                    record.fragment_sizes.len(),
                )?;
            }
            Entry::Nested(index) => {
                if let Some(nested) = substream.nested.get(index) {
                    dump_substream(out, factory, "nested", nested, depth + 1, budget)?;
                }
            }
        }
    }
    Ok(())
}

fn first_difference(a: &DocumentGraph, b: &DocumentGraph) -> Option<usize> {
    let a = a.logical_records();
    let b = b.logical_records();
    let common = a.len().min(b.len());
    (0..common)
        .find(|&i| a[i].opcode != b[i].opcode || a[i].payload() != b[i].payload())
        .or((a.len() != b.len()).then_some(common))
}
