use std::{
    ffi::OsString,
    fs::File,
    io::{self, BufReader, BufWriter, Write},
    os::fd::AsFd,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{bail, Context, Result};
use clap::{error::ErrorKind, ArgAction, CommandFactory, Parser};
use log::info;

use tarix::{
    create::{create_index, CreateError},
    deflate::DeflateStream,
    extract::{ExtractError, Extractor},
    index::FormatError,
    matcher::{FilterSpec, GlobFlags, MatchError, MatchMode, Matcher},
    stream::{PlainStream, TarStream},
    DEFAULT_INDEX_FILE,
};

const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// tarix: a GNU/POSIX tar indexer
///
/// By default the tar archive read from the tarfile is copied to the output while its index is
/// written.  With -x, the members selected by the patterns are extracted from the archive using
/// the index, and written to the output as a new tar stream.
#[derive(Debug, Parser)]
#[clap(
    name = "tarix",
    version,
    disable_help_flag = true,
    args_override_self = true
)]
struct App {
    /// Show this help
    #[clap(short = 'h', long, action = ArgAction::Help)]
    help: Option<bool>,

    /// Only create the index, don't pass the tar data through
    #[clap(short = 'i', overrides_with = "extract")]
    index_only: bool,

    /// Extract the members matching the patterns
    #[clap(short = 'x', overrides_with = "index_only")]
    extract: bool,

    /// The index file [default: $TARIX_OUTFILE or out.tarix]
    #[clap(short = 'f', value_name = "INDEX")]
    index: Option<PathBuf>,

    /// The tar archive [default: stdin]
    #[clap(short = 't', value_name = "TARFILE")]
    tarfile: Option<PathBuf>,

    /// Where to write tar data [default: stdout]
    #[clap(short = 'o', value_name = "OUTFILE")]
    output: Option<PathBuf>,

    /// Compress (or expect) the archive at the default level
    #[clap(short = 'z', overrides_with = "level")]
    compress: bool,

    /// Compression level, 0 to turn compression off
    #[clap(
        short = 'Z',
        value_name = "LEVEL",
        value_parser = clap::value_parser!(u32).range(0..=9),
        overrides_with = "compress"
    )]
    level: Option<u32>,

    /// The tarfile is a magnetic tape, seek with MTSEEK
    #[clap(short = 'm')]
    tape: bool,

    /// Patterns match whole filenames
    #[clap(short = 'e', overrides_with_all = ["glob", "glob_leading_dir"])]
    exact: bool,

    /// Patterns are shell globs; wildcards don't match '/'
    #[clap(short = 'g', overrides_with_all = ["exact", "glob_leading_dir"])]
    glob: bool,

    /// Like -g, and a pattern matching a directory matches everything below it
    #[clap(short = 'G', overrides_with_all = ["exact", "glob"])]
    glob_leading_dir: bool,

    /// Extract the members that don't match instead
    #[clap(short = 'v')]
    invert: bool,

    /// Log debugging messages
    #[clap(short = 'd')]
    debug: bool,

    /// Filename patterns selecting members to extract
    patterns: Vec<String>,
}

impl App {
    fn compression_level(&self) -> u32 {
        match self.level {
            Some(level) => level,
            None if self.compress => DEFAULT_COMPRESSION_LEVEL,
            None => 0,
        }
    }

    fn filter(&self) -> FilterSpec {
        let mode = if self.exact {
            MatchMode::Exact
        } else if self.glob {
            MatchMode::Glob(GlobFlags {
                pathname: true,
                leading_dir: false,
            })
        } else if self.glob_leading_dir {
            MatchMode::Glob(GlobFlags {
                pathname: true,
                leading_dir: true,
            })
        } else {
            MatchMode::Prefix
        };

        FilterSpec {
            patterns: self.patterns.clone(),
            mode,
            invert: self.invert,
        }
    }

    fn index_path(&self, outfile_env: Option<OsString>) -> PathBuf {
        self.index
            .clone()
            .or(outfile_env.map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_INDEX_FILE))
    }
}

/// Parses the command line with the options from `$TARIX` in front of it, so that the command
/// line wins wherever both give the same option.
fn parse_args(
    env_options: Option<&str>,
    args: impl IntoIterator<Item = OsString>,
) -> Result<App, clap::Error> {
    let mut args = args.into_iter();
    let name = args.next().unwrap_or_else(|| "tarix".into());

    let env_words: Vec<OsString> = env_options
        .unwrap_or_default()
        .split_whitespace()
        .map(OsString::from)
        .collect();

    if !env_words.is_empty() {
        let from_env = App::try_parse_from(std::iter::once(name.clone()).chain(env_words.clone()))?;
        if !from_env.patterns.is_empty() {
            return Err(App::command().error(
                ErrorKind::UnknownArgument,
                "$TARIX may only contain options, not patterns",
            ));
        }
    }

    App::try_parse_from(std::iter::once(name).chain(env_words).chain(args))
}

fn open_input(path: Option<&Path>) -> Result<File> {
    match path {
        Some(path) => File::open(path).with_context(|| format!("open tarfile {path:?}")),
        None => {
            let fd = io::stdin()
                .as_fd()
                .try_clone_to_owned()
                .context("duplicate stdin")?;
            Ok(File::from(fd))
        }
    }
}

fn open_output(path: Option<&Path>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("create output {path:?}"))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    })
}

fn create(app: &App, index_path: &Path) -> Result<()> {
    let tar = open_input(app.tarfile.as_deref())?;
    let passthrough: Box<dyn Write> = if app.index_only {
        Box::new(io::sink())
    } else {
        open_output(app.output.as_deref())?
    };
    let index = BufWriter::new(
        File::create(index_path).with_context(|| format!("create indexfile {index_path:?}"))?,
    );

    let stats = create_index(
        BufReader::new(tar),
        passthrough,
        index,
        app.compression_level(),
    )?;
    info!("wrote {} entries to {index_path:?}", stats.members);
    Ok(())
}

fn extract(app: &App, index_path: &Path) -> Result<()> {
    let level = app.compression_level();
    let index = BufReader::new(
        File::open(index_path).with_context(|| format!("open indexfile {index_path:?}"))?,
    );
    let tar = open_input(app.tarfile.as_deref())?;

    let stream: Box<dyn TarStream> = if app.tape {
        if level != 0 {
            bail!("tape seeking can't be combined with compression");
        }
        tape_stream(tar)?
    } else if level != 0 {
        Box::new(DeflateStream::new(tar))
    } else {
        Box::new(PlainStream::new(tar))
    };

    let matcher = Matcher::new(&app.filter())?;
    let output = open_output(app.output.as_deref())?;

    let mut extractor = Extractor::new(stream, output, matcher, level);
    extractor.run(index)?;
    let (stats, _) = extractor.finish()?;
    info!(
        "extracted {} of {} entries with {} seeks",
        stats.members_extracted, stats.entries, stats.seeks
    );
    Ok(())
}

#[cfg(target_os = "linux")]
fn tape_stream(tar: File) -> Result<Box<dyn TarStream>> {
    Ok(Box::new(tarix::stream::TapeStream::new(tar)))
}

#[cfg(not(target_os = "linux"))]
fn tape_stream(_tar: File) -> Result<Box<dyn TarStream>> {
    bail!("tape seeking is only supported on Linux");
}

/// 1 for bad configuration or a bad index, 2 for I/O failures while streaming.
fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<ExtractError>() {
            return e.exit_code();
        } else if let Some(e) = cause.downcast_ref::<CreateError>() {
            return e.exit_code();
        } else if cause.downcast_ref::<MatchError>().is_some() {
            return 2;
        } else if cause.downcast_ref::<FormatError>().is_some() {
            return 1;
        }
    }
    1
}

fn main() -> ExitCode {
    let env_options = std::env::var("TARIX").ok();
    let app = match parse_args(env_options.as_deref(), std::env::args_os()) {
        Ok(app) => app,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let mut logger = env_logger::Builder::from_default_env();
    if app.debug {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();

    let index_path = app.index_path(std::env::var_os("TARIX_OUTFILE"));
    let result = if app.extract {
        extract(&app, &index_path)
    } else {
        create(&app, &index_path)
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tarix: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}
