//! Handler tree
//!
//! Each handler pairs a match specification with optional authentication,
//! access logging, an action and ordered child handlers. Resolution walks the
//! tree depth-first: the first matching sibling wins, its children are tried
//! next, and a handler whose children all fail to match handles the request
//! itself.

use crate::access_log::{AccessLogger, TracingAccessLogger};
use crate::action::{Action, ActionEnv};
use crate::auth::{Authenticator, BasicAuthenticator};
use crate::config::HandlerConfig;
use crate::context::RequestContext;
use crate::matcher::MatchSpec;
use anyhow::Context;
use std::sync::Arc;
use tracing::{debug, error};

pub struct Handler {
    match_spec: MatchSpec,
    authenticator: Option<Arc<dyn Authenticator>>,
    access_logger: Option<Arc<dyn AccessLogger>>,
    action: Option<Action>,
    children: Vec<Handler>,
}

impl Handler {
    pub fn from_config(config: &HandlerConfig, env: &ActionEnv) -> anyhow::Result<Self> {
        let match_spec = MatchSpec::from_config(&config.match_spec)?;

        let authenticator = match config.authentication.as_ref().and_then(|a| a.basic.as_ref()) {
            Some(basic) => Some(Arc::new(BasicAuthenticator::new(basic)?) as Arc<dyn Authenticator>),
            None => None,
        };

        let access_logger = match &config.access_log {
            Some(log) => Some(Arc::new(
                TracingAccessLogger::new(&log.format).context("invalid access log format")?,
            ) as Arc<dyn AccessLogger>),
            None => None,
        };

        let action = Action::from_config(config, env)?;
        let children = config
            .handlers
            .iter()
            .enumerate()
            .map(|(i, child)| {
                Handler::from_config(child, env).with_context(|| format!("handlers[{}]", i))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        if action.is_none() && children.is_empty() {
            anyhow::bail!("handler has neither an action nor child handlers");
        }

        Ok(Self {
            match_spec,
            authenticator,
            access_logger,
            action,
            children,
        })
    }

    pub fn action(&self) -> Option<&Action> {
        self.action.as_ref()
    }

    pub fn children(&self) -> &[Handler] {
        &self.children
    }

    /// Start the action, then every child in order. On failure everything
    /// already started is stopped again before the error is returned.
    pub fn start(&self) -> anyhow::Result<()> {
        if let Some(action) = &self.action {
            action
                .start()
                .with_context(|| format!("cannot start {} action", action.name()))?;
        }

        for (i, child) in self.children.iter().enumerate() {
            if let Err(e) = child.start() {
                for started in self.children[..i].iter().rev() {
                    started.stop();
                }
                if let Some(action) = &self.action {
                    action.stop();
                }
                return Err(e);
            }
        }

        Ok(())
    }

    /// Stop children in reverse order, then the action
    pub fn stop(&self) {
        for child in self.children.iter().rev() {
            child.stop();
        }
        if let Some(action) = &self.action {
            action.stop();
        }
    }

    fn bind(&self, ctx: &mut RequestContext, subpath: Option<String>) {
        if subpath.is_some() {
            ctx.subpath = subpath;
        }
        if let Some(authenticator) = &self.authenticator {
            ctx.authenticator = Some(authenticator.clone());
        }
        if let Some(logger) = &self.access_logger {
            ctx.access_logger = Some(logger.clone());
        }
    }
}

/// Find the handler for a request. The context picks up the subpath and the
/// authentication and logging bindings of every handler on the matched path.
pub fn resolve<'a>(
    handlers: &'a [Handler],
    ctx: &mut RequestContext,
    fallback: Option<&'a Handler>,
) -> Option<&'a Handler> {
    for handler in handlers {
        if let Some(outcome) = handler.match_spec.matches(ctx) {
            handler.bind(ctx, outcome.subpath);
            return resolve(&handler.children, ctx, Some(handler));
        }
    }
    fallback
}

/// Build and start a list of root handlers. If any fails, the ones already
/// started are stopped.
pub fn build_tree(configs: &[HandlerConfig], env: &ActionEnv) -> anyhow::Result<Vec<Handler>> {
    let handlers = configs
        .iter()
        .enumerate()
        .map(|(i, config)| {
            Handler::from_config(config, env).with_context(|| format!("handlers[{}]", i))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    for (i, handler) in handlers.iter().enumerate() {
        if let Err(e) = handler.start() {
            error!(handler = i, error = %e, "Failed to start handler");
            stop_tree(&handlers[..i]);
            return Err(e.context(format!("handlers[{}]", i)));
        }
    }

    debug!(handlers = handlers.len(), "Handler tree started");
    Ok(handlers)
}

pub fn stop_tree(handlers: &[Handler]) {
    for handler in handlers.iter().rev() {
        handler.stop();
    }
}
