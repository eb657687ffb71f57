// ABOUTME: Binary entrypoint: run the chat server or mint an operator token
// ABOUTME: Loads environment configuration, initializes logging, starts the listener
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

use std::env;

use quill_chat_server::config::ServerConfig;
use quill_chat_server::errors::AppResult;
use quill_chat_server::logging::init_logging;
use quill_chat_server::models::User;
use quill_chat_server::server::{run, ServerResources};

#[tokio::main]
async fn main() -> AppResult<()> {
    let config = ServerConfig::from_env()?;
    init_logging(&config.logging);

    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("mint-token") => {
            let email = args
                .get(2)
                .map_or("dev@example.com", String::as_str)
                .to_owned();
            mint_token(config, &email).await
        }
        Some("--help" | "-h") => {
            println!(
                "Usage: quill-chat-server [COMMAND]\n\n\
                 Commands:\n\
                 \x20\x20(none)              Run the chat server\n\
                 \x20\x20mint-token [EMAIL]  Create the user if needed and print a bearer token"
            );
            Ok(())
        }
        _ => {
            let resources = ServerResources::initialize(config).await?;
            run(resources).await
        }
    }
}

/// Create (or reuse) a user and print a bearer token for local operation
async fn mint_token(config: ServerConfig, email: &str) -> AppResult<()> {
    let resources = ServerResources::initialize(config).await?;

    let user = match resources.users.get_by_email(email).await? {
        Some(user) => user,
        None => {
            let user = User::new(email);
            resources.users.create(&user).await?;
            user
        }
    };

    let token = resources.auth.generate_token(user.id, user.role)?;
    println!("user: {} ({})", user.email, user.id);
    println!("token: {token}");
    Ok(())
}
