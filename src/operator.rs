//! The person at the calibration bench.
//!
//! Calibration code asks through the [`Operator`] trait and never talks to a terminal itself.

use std::collections::VecDeque;

use inquire::{Confirm, Select, Text};
use log::info;

use crate::error::{Error, Result};

pub trait Operator {
    /// Block until the operator lets the run proceed. Refusing is an error.
    fn confirm(&mut self, prompt: &str) -> Result<()>;

    fn request_text(&mut self, prompt: &str) -> Result<String>;

    /// One of `options`, as chosen by the operator.
    fn request_choice(&mut self, prompt: &str, options: &[String]) -> Result<String>;
}

impl<O: Operator + ?Sized> Operator for Box<O> {
    fn confirm(&mut self, prompt: &str) -> Result<()> {
        (**self).confirm(prompt)
    }

    fn request_text(&mut self, prompt: &str) -> Result<String> {
        (**self).request_text(prompt)
    }

    fn request_choice(&mut self, prompt: &str, options: &[String]) -> Result<String> {
        (**self).request_choice(prompt, options)
    }
}

/// Asks on the terminal.
#[derive(Debug, Default)]
pub struct InquireOperator;

impl Operator for InquireOperator {
    fn confirm(&mut self, prompt: &str) -> Result<()> {
        let proceed = Confirm::new(prompt)
            .with_default(true)
            .prompt()
            .map_err(|e| Error::Operator(e.to_string()))?;
        if proceed {
            Ok(())
        } else {
            Err(Error::Operator(format!("declined: {prompt}")))
        }
    }

    fn request_text(&mut self, prompt: &str) -> Result<String> {
        Text::new(prompt)
            .prompt()
            .map_err(|e| Error::Operator(e.to_string()))
    }

    fn request_choice(&mut self, prompt: &str, options: &[String]) -> Result<String> {
        Select::new(prompt, options.to_vec())
            .prompt()
            .map_err(|e| Error::Operator(e.to_string()))
    }
}

/// Runs unattended: every gate is passed, every question is refused.
#[derive(Debug, Default)]
pub struct AutoOperator;

impl Operator for AutoOperator {
    fn confirm(&mut self, prompt: &str) -> Result<()> {
        info!("Auto-confirmed: {}", prompt);
        Ok(())
    }

    fn request_text(&mut self, prompt: &str) -> Result<String> {
        Err(Error::Operator(format!("no answer in unattended mode: {prompt}")))
    }

    fn request_choice(&mut self, prompt: &str, _options: &[String]) -> Result<String> {
        Err(Error::Operator(format!("no answer in unattended mode: {prompt}")))
    }
}

/// Answers from a prepared script and remembers what it was asked.
#[derive(Debug, Default)]
pub struct ScriptedOperator {
    answers: VecDeque<String>,
    prompts: Vec<String>,
    confirmations: usize,
    decline: bool,
}

impl ScriptedOperator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the answer to the next text or choice request.
    pub fn answer(mut self, answer: impl Into<String>) -> Self {
        self.answers.push_back(answer.into());
        self
    }

    /// Refuse every confirmation.
    pub fn declining(mut self) -> Self {
        self.decline = true;
        self
    }

    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    pub fn confirmations(&self) -> usize {
        self.confirmations
    }

    fn next_answer(&mut self, prompt: &str) -> Result<String> {
        self.prompts.push(prompt.to_string());
        self.answers
            .pop_front()
            .ok_or_else(|| Error::Operator(format!("no scripted answer for: {prompt}")))
    }
}

impl Operator for ScriptedOperator {
    fn confirm(&mut self, prompt: &str) -> Result<()> {
        self.prompts.push(prompt.to_string());
        if self.decline {
            return Err(Error::Operator(format!("declined: {prompt}")));
        }
        self.confirmations += 1;
        Ok(())
    }

    fn request_text(&mut self, prompt: &str) -> Result<String> {
        self.next_answer(prompt)
    }

    fn request_choice(&mut self, prompt: &str, options: &[String]) -> Result<String> {
        let answer = self.next_answer(prompt)?;
        if options.contains(&answer) {
            Ok(answer)
        } else {
            Err(Error::Operator(format!(
                "'{answer}' is not one of {}",
                options.join("/")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_operator_answers_in_order() {
        let mut operator = ScriptedOperator::new().answer("123456").answer("80A");
        operator.confirm("Apply input step 2").unwrap();
        assert_eq!(operator.request_text("Serial").unwrap(), "123456");
        let options = vec!["100A".to_string(), "80A".to_string()];
        assert_eq!(operator.request_choice("Model", &options).unwrap(), "80A");
        assert!(operator.request_text("Again").is_err());
        assert_eq!(operator.confirmations(), 1);
        assert_eq!(operator.prompts().len(), 4);
    }

    #[test]
    fn scripted_choice_must_be_an_option() {
        let mut operator = ScriptedOperator::new().answer("60A");
        let options = vec!["100A".to_string(), "80A".to_string()];
        assert!(matches!(
            operator.request_choice("Model", &options),
            Err(Error::Operator(_))
        ));
    }

    #[test]
    fn declining_is_an_error() {
        let mut operator = ScriptedOperator::new().declining();
        assert!(matches!(operator.confirm("go?"), Err(Error::Operator(_))));
        assert_eq!(operator.confirmations(), 0);
    }

    #[test]
    fn boxed_operator_delegates() {
        let mut operator: Box<dyn Operator> = Box::new(ScriptedOperator::new().answer("42"));
        operator.confirm("go?").unwrap();
        assert_eq!(operator.request_text("Answer").unwrap(), "42");
    }

    #[test]
    fn auto_operator_only_confirms() {
        let mut operator = AutoOperator;
        assert!(operator.confirm("go?").is_ok());
        assert!(operator.request_text("Serial").is_err());
        assert!(operator.request_choice("Model", &[]).is_err());
    }
}
