// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Classroom assignment automation.
//!
//! An instructor runs one assignment as a set of repositories on a forge: a
//! template, an optional classroom copy of it, and one repository per
//! student, all sharing an assignment prefix. classpilot keeps that set in
//! shape through a short pipeline of steps:
//!
//! 1. __sync-template__: push the template to the classroom repository.
//! 2. __discover__: enumerate student repositories of the assignment.
//! 3. __manage-secrets__: deploy secrets that are missing or too old.
//! 4. __assist-students__: offer template updates on a side branch.
//! 5. __cycle-collaborators__: repair broken collaborator access.
//!
//! The per-repository steps run concurrently through a bounded
//! [`batch::BatchExecutor`], where one broken repository never takes down its
//! siblings. The [`schedule`] module turns a pipeline into a periodic
//! unattended job.
//!
//! All forge access goes through [`forge::ForgeClient`], so everything above
//! it runs unchanged against the in-memory forge used in tests.

pub mod batch;
pub mod catalog;
pub mod config;
pub mod cycling;
pub mod forge;
pub mod orchestrator;
pub mod path;
pub mod schedule;
pub mod secrets;
pub mod template;
