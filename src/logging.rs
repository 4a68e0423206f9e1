use std::path::PathBuf;

use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::Handle;

/// Install the default log4rs configuration: a stderr console appender and,
/// when a path is given, a file appender with timestamps. Embedders that
/// bring their own `log` backend should simply not call this.
pub fn init_logging(log_filepath: Option<&PathBuf>) -> Option<Handle> {
    let console = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("{h({l})} {m}{n}")))
        .build();
    let mut config =
        Config::builder().appender(Appender::builder().build("stderr", Box::new(console)));
    let mut root = Root::builder().appender("stderr");

    if let Some(fp) = log_filepath {
        match FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new("[{d(%Y-%m-%d %H:%M:%S)}] {l} {m}{n}")))
            .build(fp)
        {
            Ok(file_appender) => {
                config = config
                    .appender(Appender::builder().build("file", Box::new(file_appender)));
                root = root.appender("file");
            }
            Err(e) => {
                eprintln!("failed to set up log file {:?}, {}", fp, e);
            }
        }
    }

    match config.build(root.build(LevelFilter::Info)) {
        Ok(config) => match log4rs::init_config(config) {
            Ok(handle) => Some(handle),
            Err(e) => {
                eprintln!("failed to initialize logging, {}", e);
                None
            }
        },
        Err(e) => {
            eprintln!("failed to build logging config, {}", e);
            None
        }
    }
}
