use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "gate-tunnel")]
#[command(author, version, about = "Multi-account game gate client with relay pool", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)，也可用 GATE_TUNNEL_LOG_LEVEL 设置
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 启动配置中的所有账号，直到 Ctrl-C
    Run {
        /// 配置文件路径
        #[arg(short, long, default_value = "gate-tunnel.toml")]
        config: String,
    },
    /// 探测所有中继并输出结果
    Probe {
        /// 配置文件路径
        #[arg(short, long, default_value = "gate-tunnel.toml")]
        config: String,

        /// 单个中继的探测超时（毫秒），默认使用配置
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,
    },
    /// 生成配置模板
    Template {
        /// 输出文件路径
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from(["gate-tunnel", "--log-level", "debug", "run", "-c", "a.toml"]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Commands::Run { ref config } if config == "a.toml"));
    }

    #[test]
    fn test_parse_probe_timeout() {
        let cli = Cli::parse_from(["gate-tunnel", "probe", "--timeout-ms", "3000"]);
        match cli.command {
            Commands::Probe { config, timeout_ms } => {
                assert_eq!(config, "gate-tunnel.toml");
                assert_eq!(timeout_ms, Some(3000));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
