use clap::Parser;

use super::config::Config;

/// 本地推理服务的流式中继
#[derive(Parser, Debug)]
#[command(name = "llama-relay", version, about, long_about = None)]
pub struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    pub config: Option<String>,

    /// 监听地址（覆盖配置文件）
    #[arg(long)]
    pub host: Option<String>,

    /// 监听端口（覆盖配置文件）
    #[arg(short, long)]
    pub port: Option<u16>,

    /// 推理服务地址（覆盖配置文件）
    #[arg(long)]
    pub upstream: Option<String>,
}

impl Args {
    /// 用命令行参数覆盖配置
    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(upstream) = &self.upstream {
            config.upstream_url = upstream.clone();
        }
    }
}
