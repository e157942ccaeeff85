use std::{
    fmt::{self, Debug, Formatter},
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    thread,
};

use colored::{Color, Colorize};
use flate2::{write::GzEncoder, Compression};
use log::{error, Level, LevelFilter, Record};
use log4rs::{
    append::{
        rolling_file::{
            policy::compound::{roll::Roll, trigger::size::SizeTrigger, CompoundPolicy},
            RollingFileAppender,
        },
        Append,
    },
    config::{Appender, Config, Root},
    encode::{self, Encode},
    filter::{Filter, Response},
};
use rustyline::ExternalPrinter;
use time::{macros::format_description, Date, OffsetDateTime, UtcOffset};

const ROLL_SIZE: u64 = 50_000_000;
const LOG_DIR: &str = "logs";
const LATEST_LOG: &str = "latest.log";

const WORKSPACE_CRATES: &[&str] = &["common", "entity", "engine", "history", "rest"];

/// Installs log4rs with the console and rolling file appenders. Dropping the returned handle
/// does nothing; call [`LogFiles::finish`] on the way out to archive the latest log.
pub fn init_logger<P: ExternalPrinter + Send + 'static>(
    mut printer: P,
    level: LevelFilter,
    utc_offset: UtcOffset,
) -> anyhow::Result<LogFiles> {
    let format = LineFormat { offset: utc_offset };
    let dir = PathBuf::from(LOG_DIR);
    let roller = Arc::new(GzipRoller::new(dir.clone(), utc_offset));

    printer.print("\n".to_owned())?;
    let console = PromptAppender {
        printer: Mutex::new(printer),
        format,
    };

    let file = RollingFileAppender::builder()
        .encoder(Box::new(format))
        .build(
            dir.join(LATEST_LOG),
            Box::new(CompoundPolicy::new(
                Box::new(SizeTrigger::new(ROLL_SIZE)),
                Box::new(SharedRoller(Arc::clone(&roller))),
            )),
        )?;

    let config = Config::builder()
        .appender(
            Appender::builder()
                .filter(Box::new(WorkspaceFilter))
                .build("console", Box::new(console)),
        )
        .appender(
            Appender::builder()
                .filter(Box::new(WorkspaceFilter))
                .build("file", Box::new(file)),
        )
        .build(Root::builder().appenders(["console", "file"]).build(level))?;

    log4rs::init_config(config)?;
    Ok(LogFiles { dir, roller })
}

/// The log directory of a running logger.
pub struct LogFiles {
    dir: PathBuf,
    roller: Arc<GzipRoller>,
}

impl LogFiles {
    /// Compresses the latest log in place of the next size-triggered roll.
    pub fn finish(self) {
        let latest = self.dir.join(LATEST_LOG);
        if latest.exists() {
            if let Err(error) = self.roller.archive(&latest, false) {
                eprintln!("Failed to archive {}: {error:?}", latest.display());
            }
        }
    }
}

/// Renders `[HH:MM:SS LEVEL file:line]: message` in a fixed offset.
#[derive(Debug, Clone, Copy)]
struct LineFormat {
    offset: UtcOffset,
}

impl LineFormat {
    fn render(&self, record: &Record<'_>) -> String {
        self.render_at(OffsetDateTime::now_utc().to_offset(self.offset), record)
    }

    fn render_at(&self, now: OffsetDateTime, record: &Record<'_>) -> String {
        let clock = now
            .format(format_description!("[hour repr:24]:[minute]:[second]"))
            .unwrap_or_else(|_| "??:??:??".to_owned());

        match source_location(record) {
            Some(location) => format!(
                "[{clock} {} {location}]: {}",
                record.level(),
                record.args()
            ),
            None => format!("[{clock} {}]: {}", record.level(), record.args()),
        }
    }
}

impl Encode for LineFormat {
    fn encode(&self, writer: &mut dyn encode::Write, record: &Record<'_>) -> anyhow::Result<()> {
        writeln!(writer, "{}", self.render(record))?;
        Ok(())
    }
}

/// `file:line` relative to the crate's `src`, for the levels where it helps.
fn source_location(record: &Record<'_>) -> Option<String> {
    if matches!(record.level(), Level::Info | Level::Warn) {
        return None;
    }

    let file = record.file()?;
    let line = record.line()?;
    let file = file.replace('\\', "/");
    let relative = match file.rfind("src/") {
        Some(start) => &file[start + "src/".len()..],
        None => file.as_str(),
    };

    Some(format!("{relative}:{line}"))
}

/// Accepts records whose module belongs to one of the workspace crates.
#[derive(Debug)]
struct WorkspaceFilter;

impl Filter for WorkspaceFilter {
    fn filter(&self, record: &Record<'_>) -> Response {
        let krate = record
            .module_path()
            .and_then(|path| path.split("::").next());

        match krate {
            Some(krate) if WORKSPACE_CRATES.contains(&krate) => Response::Neutral,
            _ => Response::Reject,
        }
    }
}

/// Prints through the console's external printer so log lines land above the prompt.
struct PromptAppender<P> {
    printer: Mutex<P>,
    format: LineFormat,
}

fn level_color(level: Level) -> Color {
    match level {
        Level::Error => Color::Red,
        Level::Warn => Color::Yellow,
        Level::Info => Color::White,
        Level::Debug => Color::BrightCyan,
        Level::Trace => Color::BrightMagenta,
    }
}

impl<P: ExternalPrinter + Send + 'static> Append for PromptAppender<P> {
    fn append(&self, record: &Record<'_>) -> anyhow::Result<()> {
        let line = self
            .format
            .render(record)
            .color(level_color(record.level()))
            .to_string();

        self.printer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .print(format!("{line}\n"))?;
        Ok(())
    }

    fn flush(&self) {}
}

impl<P> Debug for PromptAppender<P> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromptAppender")
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// Moves full logs to `<date>-<n>.log.gz`, numbering from 1 each day.
#[derive(Debug)]
struct GzipRoller {
    dir: PathBuf,
    offset: UtcOffset,
    last: Mutex<(Date, u32)>,
}

impl GzipRoller {
    fn new(dir: PathBuf, offset: UtcOffset) -> Self {
        let today = OffsetDateTime::now_utc().to_offset(offset).date();
        let prefix = date_stamp(today);

        let highest = fs::read_dir(&dir)
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter_map(|name| archive_index(&name, &prefix))
            .max()
            .unwrap_or(0);

        Self {
            dir,
            offset,
            last: Mutex::new((today, highest)),
        }
    }

    fn next_archive(&self) -> (PathBuf, PathBuf) {
        let today = OffsetDateTime::now_utc().to_offset(self.offset).date();
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        *last = if last.0 == today {
            (today, last.1 + 1)
        } else {
            (today, 1)
        };

        let stem = format!("{}-{}", date_stamp(today), last.1);
        (
            self.dir.join(format!("{stem}.log.tmp")),
            self.dir.join(format!("{stem}.log.gz")),
        )
    }

    /// Renames `file` out of the appender's way, then gzips it. The rename is immediate; the
    /// compression runs on its own thread when `background` is set.
    fn archive(&self, file: &Path, background: bool) -> anyhow::Result<()> {
        let (staged, archive) = self.next_archive();
        fs::rename(file, &staged)?;

        let compress = move || {
            if let Err(error) = gzip(&staged, &archive) {
                error!("Failed to compress {}: {error:?}", staged.display());
            }
        };

        if background {
            thread::spawn(compress);
        } else {
            compress();
        }
        Ok(())
    }
}

/// log4rs owns its roller, the handle returned from `init_logger` needs one too.
#[derive(Debug)]
struct SharedRoller(Arc<GzipRoller>);

impl Roll for SharedRoller {
    fn roll(&self, file: &Path) -> anyhow::Result<()> {
        self.0.archive(file, true)
    }
}

fn date_stamp(date: Date) -> String {
    date.format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_else(|_| date.to_string())
}

/// The `n` of `<prefix>-<n>.log.gz` or a staged `<prefix>-<n>.log.tmp`.
fn archive_index(name: &str, prefix: &str) -> Option<u32> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('-')?;
    let index = rest
        .strip_suffix(".log.gz")
        .or_else(|| rest.strip_suffix(".log.tmp"))?;
    index.parse().ok()
}

fn gzip(input: &Path, output: &Path) -> io::Result<()> {
    let mut source = File::open(input)?;
    let mut encoder = GzEncoder::new(File::create(output)?, Compression::default());
    io::copy(&mut source, &mut encoder)?;
    encoder.finish()?.sync_all()?;
    // Windows refuses to remove open files
    drop(source);
    fs::remove_file(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use time::macros::{date, datetime, offset};

    #[test]
    fn archive_names_are_numbered_per_day() {
        assert_eq!(archive_index("2022-01-03-7.log.gz", "2022-01-03"), Some(7));
        assert_eq!(archive_index("2022-01-03-2.log.tmp", "2022-01-03"), Some(2));
        assert_eq!(archive_index("2022-01-02-9.log.gz", "2022-01-03"), None);
        assert_eq!(archive_index("latest.log", "2022-01-03"), None);
        assert_eq!(date_stamp(date!(2022-01-03)), "2022-01-03");
    }

    #[test]
    fn only_workspace_crates_are_logged() {
        let ours = Record::builder()
            .module_path(Some("engine::engine::dispatcher"))
            .build();
        let sqlx = Record::builder().module_path(Some("sqlx::query")).build();
        let lookalike = Record::builder().module_path(Some("rest_client::api")).build();

        assert!(matches!(WorkspaceFilter.filter(&ours), Response::Neutral));
        assert!(matches!(WorkspaceFilter.filter(&sqlx), Response::Reject));
        assert!(matches!(WorkspaceFilter.filter(&lookalike), Response::Reject));
    }

    #[test]
    fn lines_show_the_location_only_when_useful() {
        let format = LineFormat {
            offset: offset!(-5),
        };
        let now = datetime!(2022-01-03 14:30:05 UTC).to_offset(offset!(-5));

        let info = format.render_at(
            now,
            &Record::builder()
                .level(Level::Info)
                .file(Some("engine/src/event/stream.rs"))
                .line(Some(12))
                .args(format_args!("Connected"))
                .build(),
        );
        assert_eq!(info, "[09:30:05 INFO]: Connected");

        let failure = format.render_at(
            now,
            &Record::builder()
                .level(Level::Error)
                .file(Some("engine/src/engine/dispatcher.rs"))
                .line(Some(40))
                .args(format_args!("Failed"))
                .build(),
        );
        assert_eq!(failure, "[09:30:05 ERROR engine/dispatcher.rs:40]: Failed");
    }

    #[test]
    fn finished_logs_are_gzipped() {
        let dir = std::env::temp_dir().join(format!("engine-logs-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let latest = dir.join(LATEST_LOG);
        fs::write(&latest, "[09:30:05 INFO]: Connected\n").unwrap();

        let roller = GzipRoller::new(dir.clone(), UtcOffset::UTC);
        roller.archive(&latest, false).unwrap();

        let today = date_stamp(OffsetDateTime::now_utc().date());
        let archive = dir.join(format!("{today}-1.log.gz"));
        let mut text = String::new();
        GzDecoder::new(File::open(&archive).unwrap())
            .read_to_string(&mut text)
            .unwrap();

        assert_eq!(text, "[09:30:05 INFO]: Connected\n");
        assert!(!latest.exists());
        fs::remove_dir_all(&dir).unwrap();
    }
}
