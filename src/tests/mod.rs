// Copyright The Outbox Authors
// SPDX-License-Identifier: Apache-2.0

mod common;

mod busy_poll;
mod wait_poll;
