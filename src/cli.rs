use clap::Parser;

use crate::config::AppConf;
use crate::status::Mode;

/// arachne cli
#[derive(Parser, Debug)]
#[command(name = "arachne")]
#[command(about = "Distributed web-crawling framework")]
#[command(version)]
pub struct Cli {
    /// operation surface; only the terminal is built in
    #[arg(long, default_value = "terminal", help = "User interface: [terminal]")]
    pub ui: String,

    /// run mode
    #[arg(
        short,
        long,
        default_value = "standalone",
        help = "Run mode: [standalone] [master] [worker]"
    )]
    pub mode: Mode,

    /// dispatch port
    #[arg(long, default_value = "0", help = "Dispatch port (master and worker modes)")]
    pub port: u16,

    /// master address
    #[arg(long, default_value = "", help = "Master host, without port (worker mode)")]
    pub master: String,

    /// spider selection
    #[arg(
        short,
        long,
        default_value = "*",
        help = "Comma-separated indices into the spider library, or *"
    )]
    pub spider: String,

    /// keyword input
    #[arg(
        short,
        long,
        default_value = "",
        help = "Keyword input; wrap each token in <...> for multiple"
    )]
    pub keywords: String,

    /// crawl limit
    #[arg(
        short,
        long,
        default_value = "0",
        help = "Crawl limit; 0 is unlimited, meaning depends on the spider"
    )]
    pub limit: u64,

    /// output backend
    #[arg(short, long, default_value = "csv", help = "Output backend: [csv] [jsonl]")]
    pub output: String,

    /// global concurrency
    #[arg(short, long, default_value = "20", help = "Global concurrency cap [1-99999]")]
    pub threads: usize,

    /// pause reference
    #[arg(
        long,
        default_value = "300",
        help = "Pause reference in ms (actual sleep is p/2 to 2p) [>=100]"
    )]
    pub pause_ms: u64,

    /// proxy rotation
    #[arg(
        long,
        default_value = "0",
        help = "Proxy rotation period in minutes; 0 disables proxies"
    )]
    pub proxy_minutes: u64,

    /// output batching
    #[arg(
        short,
        long,
        default_value = "10000",
        help = "Output batch capacity [1-5000000]"
    )]
    pub batch_size: usize,

    /// inherit success history
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Inherit and save success records"
    )]
    pub inherit_success: bool,

    /// inherit failure history
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Inherit and save failure records"
    )]
    pub inherit_failure: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validates mode-dependent flags and folds everything into the
    /// runtime config.
    pub fn into_conf(self) -> Result<AppConf, String> {
        match self.mode {
            Mode::Master if self.port == 0 => {
                return Err("master mode requires --port".to_string());
            }
            Mode::Worker if self.port == 0 || self.master.is_empty() => {
                return Err("worker mode requires --port and --master".to_string());
            }
            _ => {}
        }
        if self.ui != "terminal" {
            return Err(format!("unsupported ui: {}", self.ui));
        }

        let mut conf = AppConf::default();
        conf.mode = self.mode;
        conf.port = self.port;
        conf.master = self.master;
        conf.keywords = self.keywords;
        conf.set_limit(self.limit as i64)
            .set_out_type(&self.output)
            .set_thread_num(self.threads)
            .set_pause_ms(self.pause_ms)
            .set_docker_cap(self.batch_size);
        conf.proxy_minute = self.proxy_minutes;
        conf.success_inherit = self.inherit_success;
        conf.failure_inherit = self.inherit_failure;
        Ok(conf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build_a_standalone_conf() {
        let cli = Cli::parse_from(["arachne"]);
        let conf = cli.into_conf().unwrap();
        assert_eq!(conf.mode, Mode::Standalone);
        assert_eq!(conf.out_type, "csv");
        assert_eq!(conf.thread_num, 20);
    }

    #[test]
    fn worker_requires_master_and_port() {
        let cli = Cli::parse_from(["arachne", "--mode", "worker"]);
        assert!(cli.into_conf().is_err());

        let cli = Cli::parse_from([
            "arachne", "--mode", "worker", "--port", "2015", "--master", "10.0.0.2",
        ]);
        let conf = cli.into_conf().unwrap();
        assert_eq!(conf.mode, Mode::Worker);
        assert_eq!(conf.master, "10.0.0.2");
    }

    #[test]
    fn clamps_apply_to_flag_values() {
        let cli = Cli::parse_from(["arachne", "--threads", "0", "--pause-ms", "5"]);
        let conf = cli.into_conf().unwrap();
        assert_eq!(conf.thread_num, 1);
        assert_eq!(conf.pause_ms, 100);
    }
}
