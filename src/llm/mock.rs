//! 脚本回放客户端（用于测试与离线演练，无需 API）
//!
//! 按顺序返回预设回复；脚本耗尽后重复最后一条（为空时返回错误）。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message};

/// 回放客户端：每次 complete 弹出一条预设回复，并记录收到的请求
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<Option<String>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 已收到的请求次数
    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// 最近一次请求的全部消息
    pub fn last_request(&self) -> Option<Vec<Message>> {
        self.requests.lock().ok().and_then(|r| r.last().cloned())
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages.to_vec());
        }
        let next = self
            .replies
            .lock()
            .map_err(|e| e.to_string())?
            .pop_front();
        let mut last = self.last.lock().map_err(|e| e.to_string())?;
        match next {
            Some(reply) => {
                *last = Some(reply.clone());
                Ok(reply)
            }
            None => last.clone().ok_or_else(|| "Scripted client has no replies".to_string()),
        }
    }
}
