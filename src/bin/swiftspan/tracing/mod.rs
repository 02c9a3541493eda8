use std::env;

use rusty_fork::rusty_fork_test;

const EVENT_FILTER_ENV_VAR: &str = "RUST_LOG";

pub fn init_tracing(level: Option<log::Level>, json: bool) {
    let Some(level) = level else {
        // -qq silences output entirely.
        return;
    };

    let event_filter = if env::var(EVENT_FILTER_ENV_VAR).is_ok() {
        env::var(EVENT_FILTER_ENV_VAR).unwrap()
    } else {
        format!("swiftspan={level}")
    };

    let subscriber_builder = tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(event_filter);

    if json {
        subscriber_builder.json().init();
    } else {
        subscriber_builder.init();
    }
}

rusty_fork_test! {
    #[test]
    fn init_plain_tracing() {
        // This code is used for test purposes only and runs in a separate
        // process.
        unsafe { env::remove_var(EVENT_FILTER_ENV_VAR) };

        init_tracing(Some(log::Level::Info), false);
    }

    #[test]
    fn init_json_tracing() {
        unsafe { env::remove_var(EVENT_FILTER_ENV_VAR) };

        init_tracing(Some(log::Level::Debug), true);
    }

    #[test]
    fn init_with_env_override() {
        // This code is used for test purposes only and runs in a separate
        // process.
        unsafe { env::set_var(EVENT_FILTER_ENV_VAR, "trace") };

        init_tracing(Some(log::Level::Info), false);
    }

    #[test]
    fn quiet_skips_init() {
        // With no level the subscriber is never installed, so a second
        // call cannot double-init.
        init_tracing(None, false);
        init_tracing(None, true);
    }
}
