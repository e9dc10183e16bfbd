//! Vision check against the rendered small sheets.

use tracing::info;

use crate::completion::CompletionClient;
use crate::error::Result;
use crate::models::SheetImage;
use crate::prompt::Prompt;
use crate::session::SessionContext;

use super::{Lookup, NO_ANSWER_FOUND};

pub const STAGE: &str = "small_sheet_agent";

const SYSTEM_PROMPT: &str = r#"
You are an analytics bot that helps in analyzing documents.

Keep the following in mind:
- You will be given a set of documents and asked a question about them.
- Answer only if you are confident about the answer.
- You will respond in a json format.
- If the document does not contain the answer, just add "no_answer_found" to the answer key.

The json format is as follows:
{"answer": "The answer to the question", "confidence": 0.9}

If you can't answer the question, just return:
{"answer": "no_answer_found", "confidence": 0}

Respond in pure directly parseable json format.
"#;

pub struct SmallSheetAnswerer {
    client: CompletionClient,
}

impl SmallSheetAnswerer {
    pub fn new(client: CompletionClient) -> Self {
        Self { client }
    }

    pub fn prompt(question: &str, images: &[SheetImage]) -> Prompt {
        Prompt::new(SYSTEM_PROMPT)
            .text(format!(
                "\nCarefully review the attached images, tables and data.\n\
                 Based on the information provided, please answer the following question: \" {} \"\n",
                question
            ))
            .images(images.iter().map(|img| img.data_url.clone()))
    }

    pub async fn answer(
        &self,
        ctx: &SessionContext,
        question: &str,
        images: &[SheetImage],
    ) -> Result<Lookup<String>> {
        info!(session = %ctx.session_id, images = images.len(), "running small sheet check");
        let reply = self
            .client
            .complete(ctx, STAGE, &Self::prompt(question, images), "answer")
            .await?;
        Ok(Lookup::from_reply(reply, NO_ANSWER_FOUND))
    }
}
