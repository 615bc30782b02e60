//! # Session Proxy 主程序

use session_proxy::{
    Result, config, lerror, linfo,
    logging::{self, LogComponent, LogStage},
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::ProxyConfig::from_env();
    logging::init_optimized_logging(config.log_level.as_ref());

    if let Err(e) = config::validate_config(&config) {
        lerror!(
            "system",
            LogStage::Configuration,
            LogComponent::Config,
            "invalid_config",
            "配置无效",
            error = e
        );
        logging::print_logging_help();
        std::process::exit(2);
    }

    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Main,
        "service_starting",
        "服务启动",
        listen = config.listen_address(),
        gateway = config.gateway_url
    );
    if let Err(e) = session_proxy::app::run(config).await {
        lerror!(
            "system",
            LogStage::Startup,
            LogComponent::Main,
            "service_start_failed",
            "服务启动失败",
            error = e
        );
        std::process::exit(1);
    }

    linfo!(
        "system",
        LogStage::Shutdown,
        LogComponent::Main,
        "service_shutdown",
        "服务正常关闭"
    );
    Ok(())
}
