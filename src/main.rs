#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process;

use spa_rd::aggregate::aggregate;
use spa_rd::config::{AnalysisConfig, Outcome};
use spa_rd::data::{AGE_OFFSET, load_observations};
use spa_rd::pipeline::{individual_randinf, run_analysis, window_selection};
use spa_rd::randinf::FuzzyStatistic;
use spa_rd::randomization::TestStatistic;
use spa_rd::report;

#[derive(Clone, Copy, ValueEnum)]
pub enum StatisticCli {
    Diffmeans,
    Ksmirnov,
    Ranksum,
}

impl From<StatisticCli> for TestStatistic {
    fn from(value: StatisticCli) -> Self {
        match value {
            StatisticCli::Diffmeans => TestStatistic::DiffMeans,
            StatisticCli::Ksmirnov => TestStatistic::KolmogorovSmirnov,
            StatisticCli::Ranksum => TestStatistic::RankSum,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum FuzzyStatCli {
    Ar,
    Tsls,
}

impl From<FuzzyStatCli> for FuzzyStatistic {
    fn from(value: FuzzyStatCli) -> Self {
        match value {
            FuzzyStatCli::Ar => FuzzyStatistic::AndersonRubin,
            FuzzyStatCli::Tsls => FuzzyStatistic::Tsls,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutcomeCli {
    Physical,
    Mental,
}

#[derive(Args)]
pub struct CommonArgs {
    /// Survey data file (.dta, .csv, .tsv, .parquet or .arrow)
    #[arg(value_name = "DATA")]
    pub data: PathBuf,

    /// TOML configuration; built-in defaults are used when omitted
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Seed for the permutation draws
    #[arg(long)]
    pub seed: Option<u64>,

    /// Number of permutation replications
    #[arg(long)]
    pub reps: Option<usize>,

    /// Health score used as the outcome
    #[arg(long, value_enum)]
    pub outcome: Option<OutcomeCli>,
}

impl CommonArgs {
    fn load_config(&self) -> Result<AnalysisConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => AnalysisConfig::load(path)?,
            None => AnalysisConfig::default(),
        };
        if let Some(seed) = self.seed {
            config.inference.seed = seed;
        }
        if let Some(reps) = self.reps {
            config.inference.reps = reps;
        }
        if let Some(outcome) = self.outcome {
            config.design.outcome = match outcome {
                OutcomeCli::Physical => Outcome::Physical,
                OutcomeCli::Mental => Outcome::Mental,
            };
        }
        Ok(config)
    }
}

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Directory for the rendered SVG charts
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct WinselectArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Smallest half-width scanned
    #[arg(long)]
    pub wmin: Option<f64>,

    /// Increment between consecutive half-widths
    #[arg(long)]
    pub wstep: Option<f64>,

    /// Number of windows scanned
    #[arg(long)]
    pub nwindows: Option<usize>,

    /// Balance level a window's minimum p-value must exceed
    #[arg(long)]
    pub level: Option<f64>,

    /// Use large-sample p-values instead of permutations
    #[arg(long)]
    pub approximate: bool,

    /// Balance test statistic
    #[arg(long, value_enum)]
    pub statistic: Option<StatisticCli>,
}

#[derive(Args)]
pub struct RandinfArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Left window bound
    #[arg(long, allow_negative_numbers = true, requires = "wr")]
    pub wl: Option<f64>,

    /// Right window bound
    #[arg(long, allow_negative_numbers = true, requires = "wl")]
    pub wr: Option<f64>,

    /// Select the window from covariate balance instead of fixed bounds
    #[arg(long, conflicts_with_all = ["wl", "wr"])]
    pub select_window: bool,

    /// Order of the polynomial adjustment (0 = difference in means)
    #[arg(long)]
    pub order: Option<usize>,

    /// Test statistic for the randomization test
    #[arg(long, value_enum)]
    pub statistic: Option<StatisticCli>,

    /// Fuzzy statistic: Anderson-Rubin (no estimate) or TSLS
    #[arg(long, value_enum)]
    pub fuzzy_stat: Option<FuzzyStatCli>,
}

#[derive(Parser)]
#[command(
    name = "spa-rd",
    version,
    about = "Regression discontinuity analysis of retirement at the state pension age"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full analysis: charts, regressions, window selection and both RD estimates
    #[command(about = "Run the full analysis (outputs: SVG charts, printed summaries)")]
    Run(RunArgs),

    /// Print the per-age aggregate table
    #[command(about = "Print mean retirement and health by age offset")]
    Aggregate(CommonArgs),

    /// Scan windows around the cutoff for covariate balance
    #[command(about = "Select the estimation window from covariate balance")]
    Winselect(WinselectArgs),

    /// Randomization inference on individual rows
    #[command(about = "Randomization-inference fuzzy RD on individual rows")]
    Randinf(RandinfArgs),
}

fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = args.common.load_config()?;
    if let Some(dir) = args.output_dir {
        config.plots.output_dir = dir;
    }
    let analysis = run_analysis(&args.common.data, &config)?;
    println!("{}", analysis.render()?);
    Ok(())
}

fn run_aggregate(args: CommonArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.load_config()?;
    let table = load_observations(&args.data, &config.data)?;
    let aggregated = aggregate(&table, AGE_OFFSET)?;
    println!("{}", report::format_aggregate(&aggregated)?);
    Ok(())
}

fn run_winselect(args: WinselectArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = args.common.load_config()?;
    if args.wmin.is_some() {
        config.window.wmin = args.wmin;
    }
    if let Some(wstep) = args.wstep {
        config.window.wstep = wstep;
    }
    if let Some(nwindows) = args.nwindows {
        config.window.nwindows = nwindows;
    }
    if args.level.is_some() {
        config.window.level = args.level;
    }
    if let Some(statistic) = args.statistic {
        config.window.statistic = statistic.into();
    }
    config.window.approximate |= args.approximate;
    config.validate()?;

    let table = load_observations(&args.common.data, &config.data)?;
    let selection = window_selection(&table, &config)?;
    println!("{}", report::format_window_selection(&selection, &table.covariate_names));
    Ok(())
}

fn run_randinf(args: RandinfArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = args.common.load_config()?;
    if args.select_window {
        config.randinf.wl = None;
        config.randinf.wr = None;
    } else if let (Some(wl), Some(wr)) = (args.wl, args.wr) {
        config.randinf.wl = Some(wl);
        config.randinf.wr = Some(wr);
    }
    if let Some(order) = args.order {
        config.randinf.order = order;
    }
    if let Some(statistic) = args.statistic {
        config.randinf.statistic = statistic.into();
    }
    if let Some(fuzzy) = args.fuzzy_stat {
        config.randinf.fuzzy = fuzzy.into();
    }
    config.validate()?;

    let table = load_observations(&args.common.data, &config.data)?;
    let result = individual_randinf(&table, &config, None)?;
    println!(
        "{}",
        report::format_randinf("Randomization inference, individual level", &result)
    );
    Ok(())
}

fn print_usage() -> Result<(), Box<dyn std::error::Error>> {
    Cli::command().print_help()?;
    println!();
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Aggregate(args)) => run_aggregate(args),
        Some(Commands::Winselect(args)) => run_winselect(args),
        Some(Commands::Randinf(args)) => run_randinf(args),
        None => print_usage(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
