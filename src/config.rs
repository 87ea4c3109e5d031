use clap::Parser;
use std::env;
use std::path::PathBuf;

use crate::error::ConfigError;

/// The environment variable checked for the bearer token when `--key` is not given.
pub const API_KEY_ENV_VAR: &str = "OPENAI_API_SECRET_KEY";

#[derive(Debug, Parser)]
#[clap(
    name = "tokentint",
    version = "0.1.0",
    author = "Timothy Bogdala",
    about = "Streams a text completion and colors each token by the model's confidence. Reads from STDIN if '--prompt' is not supplied."
)]
pub struct Config {
    #[clap(
        long("api"),
        value_name = "URL",
        help = "The API endpoint base URL to use.",
        default_value = "https://api.openai.com"
    )]
    pub api: String,

    #[clap(
        long("key"),
        value_name = "API_KEY",
        help = "Sets the API key for remote endpoint; if absent, the envvar 'OPENAI_API_SECRET_KEY' is checked",
        default_value = ""
    )]
    pub api_key: String,

    #[clap(
        long,
        value_name = "PROMPT",
        help = "Sets the prompt for the AI instead of reading from STDIN"
    )]
    pub prompt: Option<String>,

    #[clap(
        short('n'),
        long,
        value_name = "INT",
        help = "Sets the maximum number of tokens to generate in the completion",
        default_value_t = 32
    )]
    pub max_tokens: u32,

    #[clap(
        long,
        value_name = "MODEL_ID",
        help = "Sets the engine to use for generating completions with the API",
        default_value = "davinci"
    )]
    pub model: String,

    #[clap(
        long,
        value_name = "F32",
        help = "Sets the temperature for sampling",
        default_value_t = 0.7
    )]
    pub temp: f32,

    #[clap(
        long,
        value_name = "FILEPATH",
        help = "Write the HTML export to this file instead of STDOUT"
    )]
    pub html: Option<PathBuf>,

    #[clap(
        long("image"),
        value_name = "FILEPATH",
        help = "Save a screenshot of the rendered output; requires Chrome or Chromium"
    )]
    pub image_file: Option<PathBuf>,

    #[clap(
        long,
        value_name = "PATH",
        help = "The Chrome or Chromium executable to use for '--image'"
    )]
    pub chrome: Option<PathBuf>,

    #[clap(
        long,
        help = "Disable colors in the terminal output",
        default_value_t = false
    )]
    pub no_color: bool,
}

impl Config {
    /// Parses the command line and fills in the API key from the environment if needed.
    pub fn from_cli() -> Result<Self, ConfigError> {
        let config = Config::parse();
        config.resolve(env::var(API_KEY_ENV_VAR).ok())
    }

    /// Applies the API key fallback and validates the sampling parameters.
    fn resolve(mut self, env_key: Option<String>) -> Result<Self, ConfigError> {
        // Fallback to environment variable if api_key is not provided
        if self.api_key.is_empty() {
            match env_key.filter(|k| !k.is_empty()) {
                Some(key) => self.api_key = key,
                None => return Err(ConfigError::MissingApiKey(API_KEY_ENV_VAR)),
            }
        }

        if !(0.0..=2.0).contains(&self.temp) {
            return Err(ConfigError::Invalid {
                flag: "--temp",
                reason: format!("{} is outside of 0.0 to 2.0", self.temp),
            });
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::Invalid {
                flag: "--max-tokens",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(self)
    }
}
